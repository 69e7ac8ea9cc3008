//! The two boot phases served to a device.
//!
//! A freshly powered ROM wants `bootcode.bin` pushed at it (stage 1); the
//! loader that bootcode starts comes back on the bus and requests files by
//! name until it is done (stage 2). Which phase a given enumeration wants
//! is decided by its `iSerialNumber` index, handled in the scanner.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::blobs::BlobProvider;
use crate::events::ScannerObserver;
use crate::identity::DeviceFamily;
use crate::protocol::constants::{BOOTCODE_FILE, FILE_MESSAGE_SIZE, RETURN_CODE_SIZE};
use crate::protocol::messages::{BootHeader, FileCommand, FileMessage, MessageError, decode_return_code};
use crate::session::Session;
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum BootError {
    #[error("required blob missing: {0}")]
    BlobMissing(String),

    #[error("device rejected bootcode with return code {0}")]
    BootcodeRejected(u32),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Stage 1: upload `bootcode.bin` to a waiting ROM.
///
/// On success the device resets and re-enumerates shortly afterwards with
/// a different serial index, which routes it to the file server.
#[instrument(skip(transport, blobs), fields(family = %family))]
pub fn second_stage_boot<T, B>(
    transport: &T,
    blobs: &B,
    family: DeviceFamily,
) -> Result<(), BootError>
where
    T: UsbTransport,
    B: BlobProvider + ?Sized,
{
    let bootcode = blobs
        .read_blob(family, BOOTCODE_FILE)
        .ok_or_else(|| BootError::BlobMissing(BOOTCODE_FILE.into()))?;

    info!(len = bootcode.len(), "uploading bootcode");
    let header = BootHeader::new(bootcode.len() as u32);
    transport.write_payload(&header.to_bytes())?;
    transport.write_payload(&bootcode)?;

    let reply = transport.read(RETURN_CODE_SIZE)?;
    let code = decode_return_code(&reply)?;
    if code != 0 {
        return Err(BootError::BootcodeRejected(code));
    }
    info!("bootcode accepted");
    Ok(())
}

/// Stage 2: answer `GetFileSize` / `ReadFile` requests until the loader
/// reports it is done or drops off the bus.
///
/// The device rebooting mid-read is the expected way out: it surfaces as a
/// disconnected transport and ends the loop cleanly. Any other read error
/// is treated as transient and retried after `retry_delay`.
#[instrument(skip_all, fields(port = %session.port_id()))]
pub fn file_server<T, B, O>(
    transport: &T,
    blobs: &B,
    session: &Session<O>,
    retry_delay: Duration,
) -> Result<(), BootError>
where
    T: UsbTransport,
    B: BlobProvider + ?Sized,
    O: ScannerObserver,
{
    let family = session.family();
    loop {
        let buf = match transport.read(FILE_MESSAGE_SIZE) {
            Ok(buf) => buf,
            Err(TransportError::Disconnected) => {
                debug!("device left the bus, file server done");
                return Ok(());
            }
            Err(err) => {
                debug!(error = %err, "file-request read failed, retrying");
                thread::sleep(retry_delay);
                continue;
            }
        };

        session.bump();

        let message = FileMessage::parse(&buf)?;
        match message.command {
            FileCommand::GetFileSize => match blobs.read_blob(family, &message.filename) {
                Some(data) => {
                    debug!(file = %message.filename, len = data.len(), "size requested");
                    transport.send_size(data.len() as u32)?;
                }
                None => {
                    debug!(file = %message.filename, "size requested for absent file");
                    transport.send_size(0)?;
                }
            },
            FileCommand::ReadFile => match blobs.read_blob(family, &message.filename) {
                Some(data) => {
                    info!(file = %message.filename, len = data.len(), "serving file");
                    transport.write_payload(&data)?;
                }
                None => {
                    debug!(file = %message.filename, "absent file requested");
                    transport.send_size(0)?;
                }
            },
            FileCommand::Done => {
                info!("loader finished");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blobs::MemoryBlobProvider;
    use crate::events::NullObserver;
    use crate::protocol::constants::BOOT_HEADER_SIZE;
    use crate::transport::MockTransport;

    fn blobs_with_bootcode() -> MemoryBlobProvider {
        let blobs = MemoryBlobProvider::new();
        blobs.insert(DeviceFamily::Cm3Like, "bootcode.bin", vec![0xB0u8; 1500]);
        blobs
    }

    fn test_session() -> Session<NullObserver> {
        Session::new("1-1.2", DeviceFamily::Cm3Like, Arc::new(NullObserver))
    }

    #[test]
    fn stage1_writes_header_then_payload() {
        let transport = MockTransport::new();
        transport.queue_return_code(0);
        let blobs = blobs_with_bootcode();

        second_stage_boot(&transport, &blobs, DeviceFamily::Cm3Like).unwrap();

        // size announcements: header length, then payload length
        assert_eq!(transport.sizes(), vec![BOOT_HEADER_SIZE as u32, 1500]);
        let chunks = transport.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), BOOT_HEADER_SIZE);
        assert_eq!(&chunks[0][..4], &1500u32.to_le_bytes());
        assert!(chunks[0][4..].iter().all(|&b| b == 0));
        assert_eq!(chunks[1].len(), 1500);
    }

    #[test]
    fn stage1_missing_bootcode_is_fatal() {
        let transport = MockTransport::new();
        let blobs = MemoryBlobProvider::new();
        let err = second_stage_boot(&transport, &blobs, DeviceFamily::Cm4).unwrap_err();
        assert!(matches!(err, BootError::BlobMissing(name) if name == "bootcode.bin"));
        assert!(transport.sizes().is_empty());
    }

    #[test]
    fn stage1_nonzero_return_code_is_fatal() {
        let transport = MockTransport::new();
        transport.queue_return_code(0x80);
        let blobs = blobs_with_bootcode();
        let err = second_stage_boot(&transport, &blobs, DeviceFamily::Cm3Like).unwrap_err();
        assert!(matches!(err, BootError::BootcodeRejected(0x80)));
    }

    #[test]
    fn file_server_answers_sizes_and_reads() {
        let transport = MockTransport::new();
        transport.queue_file_message(0, "start.elf"); // GetFileSize, present
        transport.queue_file_message(1, "start.elf"); // ReadFile, present
        transport.queue_file_message(0, "fixup.dat"); // GetFileSize, absent
        transport.queue_file_message(2, "x"); // Done

        let blobs = MemoryBlobProvider::new();
        blobs.insert(DeviceFamily::Cm3Like, "start.elf", b"ELFELF".to_vec());
        let session = test_session();

        file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap();

        // 6 (size of start.elf), 6 (write_payload prefix), 0 (fixup.dat absent)
        assert_eq!(transport.sizes(), vec![6, 6, 0]);
        assert_eq!(transport.chunks(), vec![b"ELFELF".to_vec()]);
        assert_eq!(session.step(), 4);
    }

    #[test]
    fn file_server_missing_read_is_not_fatal() {
        let transport = MockTransport::new();
        transport.queue_file_message(1, "foo.dat");
        transport.queue_file_message(2, "x");

        let blobs = MemoryBlobProvider::new();
        let session = test_session();

        file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap();
        assert_eq!(transport.sizes(), vec![0]);
        assert!(transport.chunks().is_empty());
    }

    #[test]
    fn file_server_device_gone_is_clean_exit() {
        let transport = MockTransport::new();
        transport.queue_file_message(0, "start.elf");
        transport.queue_read_error(TransportError::Disconnected);

        let blobs = MemoryBlobProvider::new();
        let session = test_session();

        file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap();
        assert_eq!(session.step(), 1);
    }

    #[test]
    fn file_server_retries_transient_read_errors() {
        let transport = MockTransport::new();
        transport.queue_read_error(TransportError::Timeout { timeout_ms: 10 });
        transport.queue_read_error(TransportError::ReadFailed("blip".into()));
        transport.queue_file_message(2, "x");

        let blobs = MemoryBlobProvider::new();
        let session = test_session();

        file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap();
        // only the successfully read message advances the step
        assert_eq!(session.step(), 1);
    }

    #[test]
    fn file_server_invalid_command_is_fatal() {
        let transport = MockTransport::new();
        transport.queue_file_message(7, "weird");

        let blobs = MemoryBlobProvider::new();
        let session = test_session();

        let err = file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            BootError::Message(MessageError::InvalidCommand(7))
        ));
    }

    #[test]
    fn file_server_empty_name_treated_as_done() {
        let transport = MockTransport::new();
        transport.queue_file_message(1, "");

        let blobs = MemoryBlobProvider::new();
        let session = test_session();

        file_server(&transport, &blobs, &session, Duration::from_millis(1)).unwrap();
        assert!(transport.sizes().is_empty());
    }
}
