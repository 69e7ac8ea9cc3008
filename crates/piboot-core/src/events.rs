//! Event surface for UI decoupling.
//!
//! The scanner reports through an observer so a CLI, daemon, or test
//! harness can follow transformations without touching the protocol code.

use crate::session::SessionInfo;

/// Events emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScannerEvent {
    /// A new transformation has begun at a port.
    Attach { session: SessionInfo },
    /// A session ended: success, failure, or assumed unplug.
    Detach { session: SessionInfo },
    /// Step advanced; `percent` is 100 once the device is mass storage.
    Progress { session: SessionInfo, percent: u8 },
    /// The initial sweep has been classified.
    Ready,
    /// Out-of-band failure (enumeration, hotplug). Protocol failures are
    /// reported by removing their session instead.
    Error { message: String },
}

/// Observer trait for receiving scanner events.
pub trait ScannerObserver: Send + Sync {
    fn on_event(&self, event: &ScannerEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ScannerObserver for NullObserver {
    fn on_event(&self, _event: &ScannerEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ScannerObserver for TracingObserver {
    fn on_event(&self, event: &ScannerEvent) {
        match event {
            ScannerEvent::Attach { session } => {
                tracing::info!(port = %session.port_id, family = %session.family, "device attached");
            }
            ScannerEvent::Detach { session } => {
                tracing::info!(port = %session.port_id, step = session.step, "session ended");
            }
            ScannerEvent::Progress { session, percent } => {
                tracing::debug!(port = %session.port_id, progress = %format!("{percent}%"), "progress");
            }
            ScannerEvent::Ready => {
                tracing::info!("initial sweep complete");
            }
            ScannerEvent::Error { message } => {
                tracing::error!("{message}");
            }
        }
    }
}
