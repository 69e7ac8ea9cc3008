//! Device identity: classify USB devices by id and derive stable keys.

use std::fmt;

use crate::protocol::constants::{
    BCM2708_BOOT_PID, BCM2710_BOOT_PID, BCM2711_BOOT_PID, BROADCOM_MSD_PID, BROADCOM_VENDOR_ID,
    CM3_BLOB_DIR, CM3_LAST_STEP, CM4_BLOB_DIR, CM4_LAST_STEP, NETCHIP_MSD_PID, NETCHIP_VENDOR_ID,
};

/// Device family, derived from the boot-ROM product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    /// CM1/CM3/CM3+/Zero class (BCM2708/BCM2710 ROMs)
    Cm3Like,
    /// CM4 (BCM2711 ROM)
    Cm4,
}

impl DeviceFamily {
    /// Terminal value of the per-session step counter.
    pub fn last_step(self) -> u32 {
        match self {
            DeviceFamily::Cm3Like => CM3_LAST_STEP,
            DeviceFamily::Cm4 => CM4_LAST_STEP,
        }
    }

    /// Blob-store subdirectory this family is served from.
    pub fn blob_dir(self) -> &'static str {
        match self {
            DeviceFamily::Cm3Like => CM3_BLOB_DIR,
            DeviceFamily::Cm4 => CM4_BLOB_DIR,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Cm3Like => write!(f, "CM3-like"),
            DeviceFamily::Cm4 => write!(f, "CM4"),
        }
    }
}

/// What a (vendor, product) pair means to the boot host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A ROM waiting for bootcode, or a stage-2 loader waiting for files.
    BootCapable(DeviceFamily),
    /// The post-boot mass-storage enumeration of a Pi.
    MassStorageOfInterest,
    /// Anything else on the bus.
    Unrelated,
}

/// Classify a USB device by its vendor/product id pair.
pub fn classify(vendor_id: u16, product_id: u16) -> Classification {
    match (vendor_id, product_id) {
        (BROADCOM_VENDOR_ID, BCM2708_BOOT_PID) | (BROADCOM_VENDOR_ID, BCM2710_BOOT_PID) => {
            Classification::BootCapable(DeviceFamily::Cm3Like)
        }
        (BROADCOM_VENDOR_ID, BCM2711_BOOT_PID) => Classification::BootCapable(DeviceFamily::Cm4),
        (BROADCOM_VENDOR_ID, BROADCOM_MSD_PID) | (NETCHIP_VENDOR_ID, NETCHIP_MSD_PID) => {
            Classification::MassStorageOfInterest
        }
        _ => Classification::Unrelated,
    }
}

/// Topological port identifier, `"<bus>-<p1>.<p2>..."`.
///
/// Stays stable while a device reboots and re-enumerates on the same
/// physical port, which makes it the session key.
pub fn port_id(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return bus.to_string();
    }
    let chain = ports
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".");
    format!("{bus}-{chain}")
}

/// Per-enumeration identifier, `"<bus>:<address>"`.
///
/// Changes on every enumeration; only suitable for deduplicating the
/// initial sweep against live attach events.
pub fn device_id(bus: u8, address: u8) -> String {
    format!("{bus}:{address}")
}
