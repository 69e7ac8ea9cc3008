//! Protocol layer: constants and wire-message codecs.

pub mod constants;
pub mod messages;

pub use messages::{BootHeader, FileCommand, FileMessage, MessageError, decode_return_code};
