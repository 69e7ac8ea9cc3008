//! Per-port session state and progress accounting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::{ScannerEvent, ScannerObserver};
use crate::identity::DeviceFamily;

/// Snapshot of a session, carried by every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub port_id: String,
    pub family: DeviceFamily,
    pub step: u32,
    pub last_step: u32,
}

impl SessionInfo {
    /// Completion percentage, `round(step / last_step × 100)` with ties
    /// rounded to even (so step 1 of 40 reads 2%, not 3%).
    pub fn progress(&self) -> u8 {
        let exact = f64::from(self.step) * 100.0 / f64::from(self.last_step);
        exact.round_ties_even() as u8
    }
}

/// Host-side tracking of one logical transformation of one physical
/// device, keyed by port id. Clones share state: the scanner keeps one
/// handle in its table while the per-device worker advances the step.
pub struct Session<O: ScannerObserver> {
    inner: Arc<SessionInner<O>>,
}

impl<O: ScannerObserver> Clone for Session<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<O> {
    port_id: String,
    family: DeviceFamily,
    last_step: u32,
    step: Mutex<u32>,
    closed: AtomicBool,
    observer: Arc<O>,
}

impl<O: ScannerObserver> Session<O> {
    pub(crate) fn new(port_id: &str, family: DeviceFamily, observer: Arc<O>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                port_id: port_id.to_string(),
                family,
                last_step: family.last_step(),
                step: Mutex::new(0),
                closed: AtomicBool::new(false),
                observer,
            }),
        }
    }

    pub fn port_id(&self) -> &str {
        &self.inner.port_id
    }

    pub fn family(&self) -> DeviceFamily {
        self.inner.family
    }

    pub fn last_step(&self) -> u32 {
        self.inner.last_step
    }

    pub fn step(&self) -> u32 {
        *self.inner.step.lock().unwrap()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            port_id: self.inner.port_id.clone(),
            family: self.inner.family,
            step: self.step(),
            last_step: self.inner.last_step,
        }
    }

    /// Assign the step counter and emit `Progress`.
    ///
    /// The counter never moves backwards (a detach handler can race a
    /// faster re-enumeration) and never past `last_step`. Returns whether
    /// the assignment happened. A closed session ignores assignments, so
    /// a worker finishing late cannot resurrect a removed session.
    pub fn set_step(&self, step: u32) -> bool {
        let step = step.min(self.inner.last_step);
        let mut current = self.inner.step.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) || step < *current {
            return false;
        }
        *current = step;
        let info = SessionInfo {
            port_id: self.inner.port_id.clone(),
            family: self.inner.family,
            step,
            last_step: self.inner.last_step,
        };
        let percent = info.progress();
        // Emitted while the step lock is held so a concurrent `close`
        // cannot slip a detach in between assignment and announcement.
        self.inner
            .observer
            .on_event(&ScannerEvent::Progress { session: info, percent });
        true
    }

    /// File-server advance: one step per served request, saturating just
    /// short of the terminal value, which is reserved for the
    /// mass-storage re-enumeration.
    pub fn bump(&self) {
        let next = {
            let current = self.inner.step.lock().unwrap();
            (*current + 1).min(self.inner.last_step - 1)
        };
        self.set_step(next);
    }

    /// Whether the step counter has reached its terminal value.
    pub fn is_terminal(&self) -> bool {
        self.step() == self.inner.last_step
    }

    /// Mark the session removed. Waits out any in-flight step emission,
    /// after which assignments are ignored for good.
    pub(crate) fn close(&self) {
        let _step = self.inner.step.lock().unwrap();
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}
