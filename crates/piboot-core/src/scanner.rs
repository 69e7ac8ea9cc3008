//! Scanner: watches the bus, owns the sessions, drives the boot protocol.
//!
//! A transformation spans two or three enumerations of the same physical
//! port (ROM, stage-2 loader, mass storage), so the scanner keys sessions
//! by topological port id and interprets each attach/detach against the
//! session it finds there.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blobs::BlobProvider;
use crate::boot::{self, BootError};
use crate::events::{ScannerEvent, ScannerObserver};
use crate::identity::{self, Classification, DeviceFamily};
use crate::protocol::constants::{
    DEFAULT_DETACH_GRACE_MS, DEFAULT_RETRY_DELAY_MS, DEFAULT_SETTLE_DELAY_MS,
    FILE_SERVER_START_STEP, SECOND_STAGE_SERIAL_INDEX, STAGE1_DETACH_STEP,
};
use crate::session::Session;
use crate::transport::{HostEvent, TransportError, UsbDevice, UsbHost};

/// Scanner configuration.
///
/// The timing knobs default to the values the ROM and loader are known to
/// tolerate; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Root of the blob store (`<root>/raspberrypi`, `<root>/cm4`).
    pub blob_root: PathBuf,
    /// How long a detached device may stay away before its session is
    /// declared unplugged.
    pub detach_grace_ms: u64,
    /// Settle time before the post-file-server open nudge.
    pub settle_delay_ms: u64,
    /// Backoff between retries of a failed file-request read.
    pub retry_delay_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            blob_root: PathBuf::from("blobs"),
            detach_grace_ms: DEFAULT_DETACH_GRACE_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl ScannerConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScannerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    retry_delay: Duration,
    settle_delay: Duration,
    detach_grace: Duration,
}

impl Timing {
    fn from_config(config: &ScannerConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            detach_grace: Duration::from_millis(config.detach_grace_ms),
        }
    }
}

struct State<O: ScannerObserver> {
    /// At most one session per port id.
    sessions: HashMap<String, Session<O>>,
    /// `"<bus>:<address>"` of every enumeration already classified, so the
    /// initial sweep and the live attach events cannot double-process one.
    seen_ids: HashSet<String>,
}

struct Shared<B, O: ScannerObserver> {
    observer: Arc<O>,
    blobs: B,
    timing: Timing,
    state: Mutex<State<O>>,
}

impl<B, O> Shared<B, O>
where
    B: BlobProvider + 'static,
    O: ScannerObserver + 'static,
{
    fn handle_attach<D>(self: Arc<Self>, device: D)
    where
        D: UsbDevice + Send + 'static,
    {
        let id = identity::device_id(device.bus_number(), device.address());
        {
            let mut state = self.state.lock().unwrap();
            if !state.seen_ids.insert(id.clone()) {
                debug!(id = %id, "already classified, skipping");
                return;
            }
        }

        let port = identity::port_id(device.bus_number(), device.port_numbers());
        match identity::classify(device.vendor_id(), device.product_id()) {
            Classification::MassStorageOfInterest => self.finish_session(&port),
            Classification::Unrelated => {}
            Classification::BootCapable(family) => {
                info!(port = %port, family = %family, serial = ?device.serial_number_index(), "boot-capable device");
                let session = self.get_or_create_session(&port, family);
                let shared = Arc::clone(&self);
                thread::spawn(move || shared.run_protocol(device, session));
            }
        }
    }

    fn handle_detach<D>(self: Arc<Self>, device: &D)
    where
        D: UsbDevice,
    {
        let id = identity::device_id(device.bus_number(), device.address());
        self.state.lock().unwrap().seen_ids.remove(&id);

        let Classification::BootCapable(family) =
            identity::classify(device.vendor_id(), device.product_id())
        else {
            return;
        };

        let port = identity::port_id(device.bus_number(), device.port_numbers());
        let session = self.get_or_create_session(&port, family);
        let target = if device.serial_number_index().is_none() {
            STAGE1_DETACH_STEP
        } else {
            session.last_step() - 1
        };
        session.set_step(target);

        // If the step is still where we left it when the grace period
        // runs out, the device never came back: treat it as unplugged.
        let expected = session.step();
        debug!(port = %port, expected, "detached, arming grace timer");
        let shared = Arc::clone(&self);
        thread::spawn(move || {
            thread::sleep(shared.timing.detach_grace);
            shared.expire_session(&port, expected);
        });
    }

    /// Run the boot phase this enumeration asks for. Any failure removes
    /// the session; nothing is re-thrown.
    fn run_protocol<D>(&self, device: D, session: Session<O>)
    where
        D: UsbDevice,
    {
        let port = session.port_id().to_string();
        if let Err(err) = self.drive_device(&device, &session) {
            warn!(port = %port, error = %err, "boot protocol failed");
            self.remove_session(&port);
        }
    }

    fn drive_device<D>(&self, device: &D, session: &Session<O>) -> Result<(), BootError>
    where
        D: UsbDevice,
    {
        let transport = device.open()?;
        match device.serial_number_index() {
            None | Some(SECOND_STAGE_SERIAL_INDEX) => {
                session.set_step(0);
                boot::second_stage_boot(&transport, &self.blobs, session.family())?;
            }
            _ => {
                session.set_step(FILE_SERVER_START_STEP);
                boot::file_server(&transport, &self.blobs, session, self.timing.retry_delay)?;
                drop(transport);
                // Some hosts keep the handle half-alive until poked, which
                // blocks the mass-storage re-enumeration.
                thread::sleep(self.timing.settle_delay);
                let _ = device.open();
            }
        }
        Ok(())
    }

    fn get_or_create_session(&self, port: &str, family: DeviceFamily) -> Session<O> {
        let session = {
            let mut state = self.state.lock().unwrap();
            if let Some(session) = state.sessions.get(port) {
                return session.clone();
            }
            let session = Session::new(port, family, Arc::clone(&self.observer));
            state.sessions.insert(port.to_string(), session.clone());
            session
        };
        info!(port = %port, family = %family, "session opened");
        self.observer.on_event(&ScannerEvent::Attach {
            session: session.info(),
        });
        session
    }

    /// The mass-storage enumeration arrived: the transformation is done.
    fn finish_session(&self, port: &str) {
        let session = {
            let state = self.state.lock().unwrap();
            state.sessions.get(port).cloned()
        };
        if let Some(session) = session {
            info!(port = %port, "device is mass storage now");
            session.set_step(session.last_step());
            self.remove_session(port);
        }
    }

    fn remove_session(&self, port: &str) {
        let session = self.state.lock().unwrap().sessions.remove(port);
        if let Some(session) = session {
            session.close();
            self.observer.on_event(&ScannerEvent::Detach {
                session: session.info(),
            });
        }
    }

    /// Grace timer callback: remove the session if nothing moved since
    /// the detach that armed it.
    fn expire_session(&self, port: &str, expected: u32) {
        let session = {
            let mut state = self.state.lock().unwrap();
            match state.sessions.get(port) {
                Some(session) if session.step() == expected => state.sessions.remove(port),
                _ => None,
            }
        };
        if let Some(session) = session {
            info!(port = %port, "no sign of life after detach, assuming unplug");
            session.close();
            self.observer.on_event(&ScannerEvent::Detach {
                session: session.info(),
            });
        }
    }
}

/// Watches a [`UsbHost`] and transforms every boot-capable device it sees.
pub struct Scanner<H, B, O>
where
    H: UsbHost,
    B: BlobProvider + 'static,
    O: ScannerObserver + 'static,
{
    host: H,
    shared: Arc<Shared<B, O>>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl<H, B, O> Scanner<H, B, O>
where
    H: UsbHost,
    B: BlobProvider + 'static,
    O: ScannerObserver + 'static,
{
    pub fn new(host: H, blobs: B, config: &ScannerConfig, observer: Arc<O>) -> Self {
        Self {
            host,
            shared: Arc::new(Shared {
                observer,
                blobs,
                timing: Timing::from_config(config),
                state: Mutex::new(State {
                    sessions: HashMap::new(),
                    seen_ids: HashSet::new(),
                }),
            }),
            dispatcher: None,
        }
    }

    /// Sweep the bus, announce readiness, then follow attach/detach
    /// events until [`stop`](Self::stop).
    ///
    /// Devices found by the sweep go through the same path as live
    /// attaches; their protocol runs may still be in flight when `Ready`
    /// fires, but their sessions have been announced.
    pub fn start(&mut self) -> Result<(), TransportError> {
        let devices = match self.host.devices() {
            Ok(devices) => devices,
            Err(err) => {
                self.shared.observer.on_event(&ScannerEvent::Error {
                    message: format!("usb enumeration failed: {err}"),
                });
                return Err(err);
            }
        };
        for device in devices {
            Arc::clone(&self.shared).handle_attach(device);
        }
        self.shared.observer.on_event(&ScannerEvent::Ready);

        let (tx, rx) = mpsc::channel();
        self.host.watch(tx)?;
        let shared = Arc::clone(&self.shared);
        self.dispatcher = Some(thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                match event {
                    HostEvent::Attached(device) => Arc::clone(&shared).handle_attach(device),
                    HostEvent::Detached(device) => Arc::clone(&shared).handle_detach(&device),
                }
            }
        }));
        Ok(())
    }

    /// Hard quiesce: unhook from the bus and forget every session without
    /// emitting detach events. In-flight protocol runs finish against
    /// their now-unreferenced sessions.
    pub fn stop(&mut self) {
        self.host.unwatch();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        let mut state = self.shared.state.lock().unwrap();
        for (_, session) in state.sessions.drain() {
            session.close();
        }
        state.seen_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Condvar;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::blobs::MemoryBlobProvider;
    use crate::transport::{MockDevice, MockHost};

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<ScannerEvent>>,
        cv: Condvar,
    }

    impl ScannerObserver for Recorder {
        fn on_event(&self, event: &ScannerEvent) {
            self.events.lock().unwrap().push(event.clone());
            self.cv.notify_all();
        }
    }

    impl Recorder {
        fn wait_for(&self, pred: impl Fn(&[ScannerEvent]) -> bool, timeout: Duration) -> bool {
            let guard = self.events.lock().unwrap();
            let (_guard, result) = self
                .cv
                .wait_timeout_while(guard, timeout, |events| !pred(events))
                .unwrap();
            !result.timed_out()
        }

        fn count(&self, pred: impl Fn(&ScannerEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            detach_grace_ms: 40,
            settle_delay_ms: 1,
            retry_delay_ms: 1,
            ..ScannerConfig::default()
        }
    }

    fn cm3_blobs() -> MemoryBlobProvider {
        let blobs = MemoryBlobProvider::new();
        blobs.insert(DeviceFamily::Cm3Like, "bootcode.bin", vec![1u8; 64]);
        blobs
    }

    fn stage1_cm3(bus: u8, address: u8, ports: &[u8]) -> MockDevice {
        let device = MockDevice::new(0x0a5c, 0x2763, bus, address, ports, None);
        device.transport().queue_return_code(0);
        device
    }

    const WAIT: Duration = Duration::from_secs(2);

    fn is_attach(e: &ScannerEvent) -> bool {
        matches!(e, ScannerEvent::Attach { .. })
    }
    fn is_detach(e: &ScannerEvent) -> bool {
        matches!(e, ScannerEvent::Detach { .. })
    }

    #[test]
    fn unrelated_devices_are_ignored() {
        let host = MockHost::new();
        host.seed(MockDevice::new(0x1d6b, 0x0002, 1, 1, &[], Some(1)));
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(
            host.clone(),
            MemoryBlobProvider::new(),
            &test_config(),
            Arc::clone(&observer),
        );
        scanner.start().unwrap();
        assert!(observer.wait_for(|e| e.iter().any(|e| matches!(e, ScannerEvent::Ready)), WAIT));
        assert_eq!(observer.count(is_attach), 0);
        scanner.stop();
    }

    #[test]
    fn sweep_session_announced_before_ready() {
        let host = MockHost::new();
        host.seed(stage1_cm3(1, 4, &[1, 2]));
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        let events = observer.events.lock().unwrap();
        let attach_at = events.iter().position(is_attach).expect("attach emitted");
        let ready_at = events
            .iter()
            .position(|e| matches!(e, ScannerEvent::Ready))
            .expect("ready emitted");
        assert!(attach_at < ready_at);
        drop(events);
        scanner.stop();
    }

    #[test]
    fn duplicate_enumeration_is_deduplicated() {
        let host = MockHost::new();
        let device = stage1_cm3(1, 4, &[1]);
        host.seed(device.clone());
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        // the same enumeration delivered again must be ignored
        host.attach(device.clone());
        assert!(observer.wait_for(
            |e| e.iter().any(|e| matches!(e, ScannerEvent::Progress { .. })),
            WAIT
        ));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(observer.count(is_attach), 1);
        scanner.stop();
    }

    #[test]
    fn protocol_failure_removes_session() {
        let host = MockHost::new();
        let device = MockDevice::new(0x0a5c, 0x2763, 1, 4, &[1], None);
        device.fail_open(TransportError::OpenFailed("busy".into()));
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        host.attach(device);
        assert!(observer.wait_for(|e| e.iter().any(is_detach), WAIT));
        assert_eq!(observer.count(is_attach), 1);
        assert_eq!(observer.count(is_detach), 1);
        scanner.stop();
    }

    #[test]
    fn missing_bootcode_removes_session() {
        let host = MockHost::new();
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(
            host.clone(),
            MemoryBlobProvider::new(),
            &test_config(),
            Arc::clone(&observer),
        );
        scanner.start().unwrap();

        host.attach(stage1_cm3(1, 4, &[1]));
        assert!(observer.wait_for(|e| e.iter().any(is_detach), WAIT));
        scanner.stop();
    }

    #[test]
    fn unplugged_device_expires_after_grace() {
        let host = MockHost::new();
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        let device = stage1_cm3(1, 4, &[1, 2]);
        host.attach(device.clone());
        assert!(observer.wait_for(
            |e| e
                .iter()
                .any(|e| matches!(e, ScannerEvent::Progress { percent: 0, .. })),
            WAIT
        ));

        host.detach(device);
        // detach assigns step 1 → 2% on a CM3
        assert!(observer.wait_for(
            |e| e
                .iter()
                .any(|e| matches!(e, ScannerEvent::Progress { percent: 2, .. })),
            WAIT
        ));
        assert!(observer.wait_for(|e| e.iter().any(is_detach), WAIT));
        assert_eq!(observer.count(is_detach), 1);
        scanner.stop();
    }

    #[test]
    fn mass_storage_without_session_is_ignored() {
        let host = MockHost::new();
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        host.attach(MockDevice::new(0x0525, 0xa4a5, 1, 9, &[1], Some(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(observer.count(is_attach), 0);
        assert_eq!(observer.count(is_detach), 0);
        scanner.stop();
    }

    #[test]
    fn detach_of_unknown_device_opens_then_expires_a_session() {
        let host = MockHost::new();
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        host.detach(MockDevice::new(0x0a5c, 0x2763, 1, 4, &[7], None));
        assert!(observer.wait_for(|e| e.iter().any(is_attach), WAIT));
        assert!(observer.wait_for(|e| e.iter().any(is_detach), WAIT));
        scanner.stop();
    }

    #[test]
    fn stop_clears_sessions_silently() {
        let host = MockHost::new();
        let observer = Arc::new(Recorder::default());
        let mut scanner = Scanner::new(host.clone(), cm3_blobs(), &test_config(), Arc::clone(&observer));
        scanner.start().unwrap();

        host.attach(stage1_cm3(1, 4, &[1]));
        assert!(observer.wait_for(
            |e| e.iter().any(|e| matches!(e, ScannerEvent::Progress { .. })),
            WAIT
        ));
        scanner.stop();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(observer.count(is_detach), 0);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = test_config();
        let path = std::env::temp_dir().join(format!("piboot-config-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = ScannerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.detach_grace_ms, 40);
        assert_eq!(loaded.blob_root, config.blob_root);
        std::fs::remove_file(path).unwrap();
    }
}
