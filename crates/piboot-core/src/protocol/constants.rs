//! Protocol constants for the Broadcom USB boot ROM.
//!
//! Derived from the BCM2708/2710/2711 boot ROM behaviour as exercised by
//! the stock `rpiboot` host tool.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Broadcom Corporation Vendor ID
pub const BROADCOM_VENDOR_ID: u16 = 0x0a5c;

/// BCM2708 boot ROM Product ID (CM1/CM3/Zero)
pub const BCM2708_BOOT_PID: u16 = 0x2763;
/// BCM2710 boot ROM Product ID (CM3+)
pub const BCM2710_BOOT_PID: u16 = 0x2764;
/// BCM2711 boot ROM Product ID (CM4)
pub const BCM2711_BOOT_PID: u16 = 0x2711;

/// Broadcom PID of a CM4 that has re-enumerated as mass storage
pub const BROADCOM_MSD_PID: u16 = 0x0001;

/// NetChip Technology Vendor ID, re-used by the CM3/Zero mass-storage gadget
pub const NETCHIP_VENDOR_ID: u16 = 0x0525;
/// NetChip PID of the CM3/Zero mass-storage gadget
pub const NETCHIP_MSD_PID: u16 = 0xa4a5;

// ============================================================================
// Wire Formats
// ============================================================================

/// Boot message header size: u32 payload length + 20-byte signature field
pub const BOOT_HEADER_SIZE: usize = 24;

/// Signature field width inside the boot header (zero-filled, unchecked)
pub const BOOT_SIGNATURE_SIZE: usize = 20;

/// File-request message size: u32 command + NUL-padded filename
pub const FILE_MESSAGE_SIZE: usize = 260;

/// Filename field width inside the file-request message
pub const FILENAME_FIELD_SIZE: usize = 256;

/// Stage-1 upload return code size (u32, 0 = accepted)
pub const RETURN_CODE_SIZE: usize = 4;

/// The stage-1 blob every family requests first
pub const BOOTCODE_FILE: &str = "bootcode.bin";

// ============================================================================
// Transfer Parameters
// ============================================================================

/// Bulk OUT chunk size (1 MiB)
pub const BULK_CHUNK_SIZE: usize = 1024 * 1024;

/// Total attempts per bulk chunk when the endpoint stalls
pub const STALL_ATTEMPTS: u32 = 3;

/// Timeout applied to every control and bulk transfer
pub const USB_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Boot Phases
// ============================================================================

/// `iSerialNumber` index announced by a BCM2711 ROM awaiting bootcode.
/// The older ROMs announce index 0, which the descriptor reports as absent.
pub const SECOND_STAGE_SERIAL_INDEX: u8 = 3;

/// Step the file-server phase starts from
pub const FILE_SERVER_START_STEP: u32 = 2;

/// Step assigned when a stage-1 device detaches (reset after bootcode)
pub const STAGE1_DETACH_STEP: u32 = 1;

/// Terminal step for CM3-class devices
pub const CM3_LAST_STEP: u32 = 40;
/// Terminal step for CM4 devices
pub const CM4_LAST_STEP: u32 = 10;

// ============================================================================
// Blob Layout
// ============================================================================

/// Blob subdirectory served to CM3-class devices
pub const CM3_BLOB_DIR: &str = "raspberrypi";
/// Blob subdirectory served to CM4 devices
pub const CM4_BLOB_DIR: &str = "cm4";

// ============================================================================
// Default Timings (overridable through `ScannerConfig`)
// ============================================================================

/// Backoff between retries of a failed file-request read
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Settle time before the post-file-server open nudge
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;

/// Grace period after a detach before the session is declared unplugged
pub const DEFAULT_DETACH_GRACE_MS: u64 = 5_000;
