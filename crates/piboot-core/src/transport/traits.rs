//! USB abstraction the boot engine is written against.
//!
//! Three seams: a per-device transport (the two framed primitives the ROM
//! understands), a device (descriptor fields plus `open`), and a host
//! (enumeration snapshot plus attach/detach events). The rusb backend
//! implements all three; the mock backend lets the protocol and scanner be
//! tested without hardware.

use std::sync::mpsc;

use thiserror::Error;
use tracing::warn;

use crate::protocol::constants::{BULK_CHUNK_SIZE, STALL_ATTEMPTS};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("interface {interface} endpoint {endpoint} is not bulk OUT")]
    EndpointMismatch { interface: u8, endpoint: u8 },

    #[error("endpoint stalled")]
    Stall,

    #[error("transfer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("device disconnected")]
    Disconnected,

    #[error("control transfer failed: {0}")]
    ControlFailed(String),

    #[error("bulk write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// The two framed primitives the boot ROM speaks, over one opened device.
pub trait UsbTransport {
    /// Announce the length of the next payload (or 0 for "absent") via a
    /// vendor OUT control transfer: `bRequest = 0`, `wValue = n & 0xFFFF`,
    /// `wIndex = n >> 16`, no data stage.
    fn send_size(&self, size: u32) -> Result<(), TransportError>;

    /// Read up to `len` bytes via the same control transfer with the
    /// direction bit set.
    fn read(&self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// One bulk OUT transfer of a single chunk.
    fn bulk_write(&self, chunk: &[u8]) -> Result<usize, TransportError>;

    /// Size-prefixed payload upload: announce the length, then stream the
    /// bytes in 1 MiB bulk chunks. A stalled chunk is retried, three
    /// attempts total; any other transfer error aborts.
    fn write_payload(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send_size(data.len() as u32)?;
        if data.is_empty() {
            return Ok(());
        }
        for chunk in data.chunks(BULK_CHUNK_SIZE) {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.bulk_write(chunk) {
                    Ok(_) => break,
                    Err(TransportError::Stall) if attempts < STALL_ATTEMPTS => {
                        warn!(attempts, len = chunk.len(), "bulk chunk stalled, retrying");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}

/// One enumeration of a USB device, descriptor fields pre-read.
pub trait UsbDevice {
    type Transport: UsbTransport;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
    fn bus_number(&self) -> u8;
    fn address(&self) -> u8;

    /// Port-number chain from the root hub; empty when unavailable.
    fn port_numbers(&self) -> &[u8];

    /// `iSerialNumber` descriptor index; `None` when the descriptor
    /// carries index 0.
    fn serial_number_index(&self) -> Option<u8>;

    /// Open the device and claim the boot interface/endpoint pair:
    /// interface 0 / endpoint 1 on single-interface devices, interface 1 /
    /// endpoint 3 otherwise. The endpoint must be bulk OUT.
    fn open(&self) -> Result<Self::Transport, TransportError>;
}

/// Attach/detach notification from the host.
#[derive(Debug)]
pub enum HostEvent<D> {
    Attached(D),
    Detached(D),
}

/// Access to the bus: a point-in-time enumeration plus event delivery.
pub trait UsbHost {
    type Device: UsbDevice + Send + 'static;

    /// Snapshot of everything currently enumerated.
    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Begin delivering attach/detach events into `tx`. The sender is
    /// dropped on `unwatch`, which closes the receiving end.
    fn watch(&mut self, tx: mpsc::Sender<HostEvent<Self::Device>>) -> Result<(), TransportError>;

    fn unwatch(&mut self);
}
