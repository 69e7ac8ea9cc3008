//! Mock USB backend for testing the protocol engine and scanner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use byteorder::{ByteOrder, LittleEndian};

use super::traits::{HostEvent, TransportError, UsbDevice, UsbHost, UsbTransport};
use crate::protocol::constants::FILE_MESSAGE_SIZE;

/// Scripted transport: reads pop a queue, writes are captured.
///
/// Clones share state, so a test can keep a handle while the scanner's
/// worker drives the one it got from [`MockDevice::open`].
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockTransportState>,
}

#[derive(Default)]
struct MockTransportState {
    reads: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    sizes: Mutex<Vec<u32>>,
    chunks: Mutex<Vec<Vec<u8>>>,
    bulk_attempts: AtomicU32,
    stall_budget: AtomicU32,
    bulk_error: Mutex<Option<TransportError>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful read.
    pub fn queue_read(&self, bytes: impl Into<Vec<u8>>) {
        self.inner.reads.lock().unwrap().push_back(Ok(bytes.into()));
    }

    /// Queue a failed read.
    pub fn queue_read_error(&self, err: TransportError) {
        self.inner.reads.lock().unwrap().push_back(Err(err));
    }

    /// Queue a 260-byte file-request message.
    pub fn queue_file_message(&self, command: u32, name: &str) {
        let mut buf = vec![0u8; FILE_MESSAGE_SIZE];
        LittleEndian::write_u32(&mut buf[..4], command);
        buf[4..4 + name.len()].copy_from_slice(name.as_bytes());
        self.queue_read(buf);
    }

    /// Queue a stage-1 return code.
    pub fn queue_return_code(&self, code: u32) {
        self.queue_read(code.to_le_bytes().to_vec());
    }

    /// Stall the next `n` bulk attempts.
    pub fn stall_next(&self, n: u32) {
        self.inner.stall_budget.store(n, Ordering::SeqCst);
    }

    /// Fail the next bulk attempt with an arbitrary error.
    pub fn fail_next_bulk(&self, err: TransportError) {
        *self.inner.bulk_error.lock().unwrap() = Some(err);
    }

    /// Sizes announced via `send_size`, in order.
    pub fn sizes(&self) -> Vec<u32> {
        self.inner.sizes.lock().unwrap().clone()
    }

    /// Bulk chunks that landed, in order.
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.inner.chunks.lock().unwrap().clone()
    }

    /// Total bulk attempts, stalled ones included.
    pub fn bulk_attempts(&self) -> u32 {
        self.inner.bulk_attempts.load(Ordering::SeqCst)
    }
}

impl UsbTransport for MockTransport {
    fn send_size(&self, size: u32) -> Result<(), TransportError> {
        self.inner.sizes.lock().unwrap().push(size);
        Ok(())
    }

    fn read(&self, _len: usize) -> Result<Vec<u8>, TransportError> {
        // A drained queue reads as a vanished device, so a file-server
        // under test terminates instead of spinning in its retry loop.
        self.inner
            .reads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Disconnected))
    }

    fn bulk_write(&self, chunk: &[u8]) -> Result<usize, TransportError> {
        self.inner.bulk_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.bulk_error.lock().unwrap().take() {
            return Err(err);
        }
        let budget = &self.inner.stall_budget;
        if budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Stall);
        }
        self.inner.chunks.lock().unwrap().push(chunk.to_vec());
        Ok(chunk.len())
    }
}

/// One scripted enumeration of a device.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockDeviceState>,
}

struct MockDeviceState {
    vendor_id: u16,
    product_id: u16,
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    serial_index: Option<u8>,
    transport: MockTransport,
    open_error: Mutex<Option<TransportError>>,
    opens: AtomicU32,
}

impl MockDevice {
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        bus: u8,
        address: u8,
        ports: &[u8],
        serial_index: Option<u8>,
    ) -> Self {
        Self {
            inner: Arc::new(MockDeviceState {
                vendor_id,
                product_id,
                bus,
                address,
                ports: ports.to_vec(),
                serial_index,
                transport: MockTransport::new(),
                open_error: Mutex::new(None),
                opens: AtomicU32::new(0),
            }),
        }
    }

    /// Handle on the transport `open` hands out, for scripting reads and
    /// inspecting writes.
    pub fn transport(&self) -> MockTransport {
        self.inner.transport.clone()
    }

    /// Fail the next `open` call.
    pub fn fail_open(&self, err: TransportError) {
        *self.inner.open_error.lock().unwrap() = Some(err);
    }

    /// How many times `open` has been called.
    pub fn open_count(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

impl UsbDevice for MockDevice {
    type Transport = MockTransport;

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id
    }

    fn bus_number(&self) -> u8 {
        self.inner.bus
    }

    fn address(&self) -> u8 {
        self.inner.address
    }

    fn port_numbers(&self) -> &[u8] {
        &self.inner.ports
    }

    fn serial_number_index(&self) -> Option<u8> {
        self.inner.serial_index
    }

    fn open(&self) -> Result<MockTransport, TransportError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.open_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.inner.transport.clone())
    }
}

/// Scripted bus: a snapshot the sweep sees, plus manual event injection.
#[derive(Clone, Default)]
pub struct MockHost {
    inner: Arc<MockHostState>,
}

#[derive(Default)]
struct MockHostState {
    snapshot: Mutex<Vec<MockDevice>>,
    tx: Mutex<Option<mpsc::Sender<HostEvent<MockDevice>>>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the snapshot the next sweep will see.
    pub fn seed(&self, device: MockDevice) {
        self.inner.snapshot.lock().unwrap().push(device);
    }

    /// Deliver a live attach event.
    pub fn attach(&self, device: MockDevice) {
        if let Some(tx) = self.inner.tx.lock().unwrap().as_ref() {
            let _ = tx.send(HostEvent::Attached(device));
        }
    }

    /// Deliver a live detach event.
    pub fn detach(&self, device: MockDevice) {
        if let Some(tx) = self.inner.tx.lock().unwrap().as_ref() {
            let _ = tx.send(HostEvent::Detached(device));
        }
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        Ok(self.inner.snapshot.lock().unwrap().clone())
    }

    fn watch(&mut self, tx: mpsc::Sender<HostEvent<MockDevice>>) -> Result<(), TransportError> {
        *self.inner.tx.lock().unwrap() = Some(tx);
        Ok(())
    }

    fn unwatch(&mut self) {
        self.inner.tx.lock().unwrap().take();
    }
}
