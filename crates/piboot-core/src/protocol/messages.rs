//! Wire messages exchanged with the boot ROM and the stage-2 loader.
//!
//! Everything here is a pure byte-level codec: little-endian integers at
//! fixed offsets, no I/O.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

use super::constants::{
    BOOT_HEADER_SIZE, BOOT_SIGNATURE_SIZE, FILENAME_FIELD_SIZE, RETURN_CODE_SIZE,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("unknown file-server command code {0}")]
    InvalidCommand(u32),
}

/// Header sent ahead of the stage-1 bootcode payload.
///
/// 24 bytes on the wire: the payload length followed by a 20-byte signature
/// field. Current ROMs ignore the signature; it stays parameterized so a
/// future secure-boot ROM can be fed a real one.
#[derive(Debug, Clone, Copy)]
pub struct BootHeader {
    pub payload_len: u32,
    pub signature: [u8; BOOT_SIGNATURE_SIZE],
}

impl BootHeader {
    pub const SIZE: usize = BOOT_HEADER_SIZE;

    /// Header with a zero-filled signature field.
    pub fn new(payload_len: u32) -> Self {
        Self {
            payload_len,
            signature: [0u8; BOOT_SIGNATURE_SIZE],
        }
    }

    pub fn with_signature(payload_len: u32, signature: [u8; BOOT_SIGNATURE_SIZE]) -> Self {
        Self {
            payload_len,
            signature,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.payload_len).unwrap();
        buf.extend_from_slice(&self.signature);
        buf
    }
}

/// Commands the stage-2 loader issues over the size-prefix read channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCommand {
    GetFileSize,
    ReadFile,
    Done,
}

/// A parsed 260-byte file-request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    pub command: FileCommand,
    pub filename: String,
}

impl FileMessage {
    /// Parse a file-request message.
    ///
    /// Bytes 0..4 carry the command code, bytes 4..260 a NUL-terminated
    /// filename; whatever follows the terminator is padding. An empty
    /// filename means the loader is finished, whatever the command code
    /// says.
    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < 4 {
            return Err(MessageError::BufferTooSmall {
                expected: 4,
                actual: buf.len(),
            });
        }
        let code = LittleEndian::read_u32(&buf[..4]);

        let field = &buf[4..buf.len().min(4 + FILENAME_FIELD_SIZE)];
        let name_end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let filename = String::from_utf8_lossy(&field[..name_end]).into_owned();

        if filename.is_empty() {
            return Ok(Self {
                command: FileCommand::Done,
                filename,
            });
        }

        let command = match code {
            0 => FileCommand::GetFileSize,
            1 => FileCommand::ReadFile,
            2 => FileCommand::Done,
            other => return Err(MessageError::InvalidCommand(other)),
        };

        Ok(Self { command, filename })
    }
}

/// Decode the 4-byte return code sent after a stage-1 upload.
pub fn decode_return_code(buf: &[u8]) -> Result<u32, MessageError> {
    if buf.len() < RETURN_CODE_SIZE {
        return Err(MessageError::BufferTooSmall {
            expected: RETURN_CODE_SIZE,
            actual: buf.len(),
        });
    }
    Ok(LittleEndian::read_u32(&buf[..RETURN_CODE_SIZE]))
}
