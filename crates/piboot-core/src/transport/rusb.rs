//! rusb-based USB backend.
//!
//! The boot ROM is driven entirely through synchronous vendor control
//! transfers and bulk OUT writes, with attach/detach delivery via libusb
//! hotplug callbacks pumped on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use rusb::{
    Context, Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, TransferType, UsbContext,
};
use tracing::{debug, info, warn};

use super::traits::{HostEvent, TransportError, UsbDevice, UsbHost, UsbTransport};
use crate::protocol::constants::USB_TIMEOUT;

fn transfer_error(err: rusb::Error) -> Option<TransportError> {
    match err {
        rusb::Error::Pipe => Some(TransportError::Stall),
        rusb::Error::Timeout => Some(TransportError::Timeout {
            timeout_ms: USB_TIMEOUT.as_millis() as u64,
        }),
        rusb::Error::NoDevice | rusb::Error::Io => Some(TransportError::Disconnected),
        _ => None,
    }
}

/// An opened boot-mode device with its bulk OUT endpoint claimed.
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    endpoint: u8,
}

impl UsbTransport for RusbTransport {
    fn send_size(&self, size: u32) -> Result<(), TransportError> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(
                request_type,
                0,
                (size & 0xFFFF) as u16,
                (size >> 16) as u16,
                &[],
                USB_TIMEOUT,
            )
            .map(drop)
            .map_err(|e| transfer_error(e).unwrap_or_else(|| TransportError::ControlFailed(e.to_string())))
    }

    fn read(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(
                request_type,
                0,
                (len as u32 & 0xFFFF) as u16,
                (len as u32 >> 16) as u16,
                &mut buf,
                USB_TIMEOUT,
            )
            .map_err(|e| transfer_error(e).unwrap_or_else(|| TransportError::ReadFailed(e.to_string())))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_write(&self, chunk: &[u8]) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(self.endpoint, chunk, USB_TIMEOUT)
            .map_err(|e| transfer_error(e).unwrap_or_else(|| TransportError::WriteFailed(e.to_string())))
    }
}

/// One enumeration of a device, descriptor fields cached at construction
/// so they stay readable after the device goes away.
pub struct RusbDevice {
    device: Device<Context>,
    vendor_id: u16,
    product_id: u16,
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    serial_index: Option<u8>,
}

impl RusbDevice {
    fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let ports = device.port_numbers().unwrap_or_default();
        Ok(Self {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus: device.bus_number(),
            address: device.address(),
            ports,
            serial_index: descriptor.serial_number_string_index(),
            device,
        })
    }
}

impl UsbDevice for RusbDevice {
    type Transport = RusbTransport;

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn bus_number(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn port_numbers(&self) -> &[u8] {
        &self.ports
    }

    fn serial_number_index(&self) -> Option<u8> {
        self.serial_index
    }

    fn open(&self) -> Result<RusbTransport, TransportError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // The ROM exposes a single interface; the stage-2 loader adds a
        // second one and moves the boot endpoint.
        let (interface, endpoint) = if config.num_interfaces() == 1 {
            (0u8, 1u8)
        } else {
            (1u8, 3u8)
        };

        let bulk_out = config.interfaces().any(|iface| {
            iface.number() == interface
                && iface.descriptors().any(|alt| {
                    alt.endpoint_descriptors().any(|ep| {
                        ep.address() == endpoint
                            && ep.direction() == Direction::Out
                            && ep.transfer_type() == TransferType::Bulk
                    })
                })
        });
        if !bulk_out {
            return Err(TransportError::EndpointMismatch {
                interface,
                endpoint,
            });
        }

        let handle = self
            .device
            .open()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(interface)
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            })?;

        info!(
            bus = self.bus,
            address = self.address,
            interface,
            endpoint,
            "device opened"
        );
        Ok(RusbTransport { handle, endpoint })
    }
}

struct HotplugForwarder {
    tx: mpsc::Sender<HostEvent<RusbDevice>>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        match RusbDevice::new(device) {
            Ok(device) => {
                let _ = self.tx.send(HostEvent::Attached(device));
            }
            Err(err) => debug!(error = %err, "unreadable device arrived, ignoring"),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        match RusbDevice::new(device) {
            Ok(device) => {
                let _ = self.tx.send(HostEvent::Detached(device));
            }
            Err(err) => debug!(error = %err, "unreadable device left, ignoring"),
        }
    }
}

/// libusb-backed host: enumeration snapshots plus hotplug delivery.
pub struct RusbHost {
    context: Context,
    registration: Option<Registration<Context>>,
    pump: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl RusbHost {
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new().map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(Self {
            context,
            registration: None,
            pump: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl UsbHost for RusbHost {
    type Device = RusbDevice;

    fn devices(&self) -> Result<Vec<RusbDevice>, TransportError> {
        let list = self
            .context
            .devices()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(list
            .iter()
            .filter_map(|device| match RusbDevice::new(device) {
                Ok(device) => Some(device),
                Err(err) => {
                    debug!(error = %err, "skipping unreadable device");
                    None
                }
            })
            .collect())
    }

    fn watch(&mut self, tx: mpsc::Sender<HostEvent<RusbDevice>>) -> Result<(), TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::OpenFailed(
                "libusb hotplug support unavailable on this platform".into(),
            ));
        }

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { tx }))
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        self.registration = Some(registration);

        self.stop.store(false, Ordering::SeqCst);
        let context = self.context.clone();
        let stop = Arc::clone(&self.stop);
        self.pump = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Err(err) = context.handle_events(Some(Duration::from_millis(250))) {
                    warn!(error = %err, "usb event pump failed");
                    break;
                }
            }
        }));
        Ok(())
    }

    fn unwatch(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the registration unhooks the callback and its sender.
        self.registration.take();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
