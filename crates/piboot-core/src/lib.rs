//! piboot-core: host side of the Broadcom USB boot protocol.
//!
//! Turns un-provisioned Raspberry Pi Compute Modules (and Zero/CM4 boards)
//! plugged in over USB into mass-storage devices, by serving the
//! multi-stage boot protocol their ROM expects.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: wire-message codecs and the ROM's constants
//! - **Identity**: vendor/product classification, port and device keys
//! - **Blobs**: the filename-addressed store the file server answers from
//! - **Transport**: USB abstraction (rusb backend, mock for tests)
//! - **Boot**: stage-1 bootcode upload and the stage-2 file server
//! - **Session / Scanner**: per-port progress tracking across
//!   re-enumerations, driven by attach/detach events
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use piboot_core::{
//!     FsBlobProvider, RusbHost, Scanner, ScannerConfig, TracingObserver,
//! };
//!
//! let config = ScannerConfig::default();
//! let host = RusbHost::new().expect("usb context");
//! let blobs = FsBlobProvider::new(&config.blob_root);
//! let mut scanner = Scanner::new(host, blobs, &config, Arc::new(TracingObserver));
//! scanner.start().expect("scanner failed to start");
//! ```

pub mod blobs;
pub mod boot;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use blobs::{BlobProvider, FsBlobProvider, MemoryBlobProvider};
pub use boot::{BootError, file_server, second_stage_boot};
pub use events::{NullObserver, ScannerEvent, ScannerObserver, TracingObserver};
pub use identity::{Classification, DeviceFamily, classify, device_id, port_id};
pub use protocol::{BootHeader, FileCommand, FileMessage, MessageError, decode_return_code};
pub use scanner::{Scanner, ScannerConfig};
pub use session::{Session, SessionInfo};
pub use transport::{
    HostEvent, MockDevice, MockHost, MockTransport, RusbHost, TransportError, UsbDevice, UsbHost,
    UsbTransport,
};
