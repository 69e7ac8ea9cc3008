//! Transport layer module.

pub mod mock;
pub mod rusb;
pub mod traits;

pub use mock::{MockDevice, MockHost, MockTransport};
pub use rusb::{RusbDevice, RusbHost, RusbTransport};
pub use traits::{HostEvent, TransportError, UsbDevice, UsbHost, UsbTransport};
