//! Blob provider: the read-only, path-addressed byte store the file server
//! answers from.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::identity::DeviceFamily;

/// A filename-addressed blob store.
///
/// Absence is a normal condition (the file server answers it with a zero
/// size), so lookups return `None` instead of an error.
pub trait BlobProvider: Send + Sync {
    fn read_blob(&self, family: DeviceFamily, name: &str) -> Option<Vec<u8>>;
}

/// Filesystem-backed provider rooted at a configured directory.
///
/// Each family resolves under its own subdirectory:
/// `<root>/raspberrypi/...` for CM3-class devices, `<root>/cm4/...` for CM4.
pub struct FsBlobProvider {
    root: PathBuf,
}

impl FsBlobProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a device-supplied name under the family subdirectory.
    ///
    /// The stage-2 loader sends forward-slash-separated paths; anything
    /// that would escape the root is refused.
    fn resolve(&self, family: DeviceFamily, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !safe {
            warn!(name, "refusing blob name that escapes the store");
            return None;
        }
        Some(self.root.join(family.blob_dir()).join(relative))
    }
}

impl BlobProvider for FsBlobProvider {
    fn read_blob(&self, family: DeviceFamily, name: &str) -> Option<Vec<u8>> {
        let path = self.resolve(family, name)?;
        match std::fs::read(&path) {
            Ok(data) => {
                debug!(path = %path.display(), len = data.len(), "blob read");
                Some(data)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "blob absent");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "blob unreadable, reporting absent");
                None
            }
        }
    }
}

/// In-memory provider for tests and embedded blob sets.
#[derive(Default)]
pub struct MemoryBlobProvider {
    blobs: Mutex<HashMap<(DeviceFamily, String), Vec<u8>>>,
}

impl MemoryBlobProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, family: DeviceFamily, name: &str, data: impl Into<Vec<u8>>) {
        self.blobs
            .lock()
            .unwrap()
            .insert((family, name.to_string()), data.into());
    }
}

impl BlobProvider for MemoryBlobProvider {
    fn read_blob(&self, family: DeviceFamily, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(family, name.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("piboot-blobs-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("raspberrypi/overlays")).unwrap();
        std::fs::create_dir_all(root.join("cm4")).unwrap();
        std::fs::write(root.join("raspberrypi/bootcode.bin"), b"cm3 bootcode").unwrap();
        std::fs::write(root.join("raspberrypi/overlays/disable-bt.dtbo"), b"dtbo").unwrap();
        std::fs::write(root.join("cm4/bootcode.bin"), b"cm4 bootcode").unwrap();
        root
    }

    #[test]
    fn reads_per_family_subdirectory() {
        let root = scratch_store("family");
        let store = FsBlobProvider::new(&root);
        assert_eq!(
            store.read_blob(DeviceFamily::Cm3Like, "bootcode.bin"),
            Some(b"cm3 bootcode".to_vec())
        );
        assert_eq!(
            store.read_blob(DeviceFamily::Cm4, "bootcode.bin"),
            Some(b"cm4 bootcode".to_vec())
        );
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn nested_names_resolve() {
        let root = scratch_store("nested");
        let store = FsBlobProvider::new(&root);
        assert_eq!(
            store.read_blob(DeviceFamily::Cm3Like, "overlays/disable-bt.dtbo"),
            Some(b"dtbo".to_vec())
        );
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn missing_blob_is_none() {
        let root = scratch_store("missing");
        let store = FsBlobProvider::new(&root);
        assert_eq!(store.read_blob(DeviceFamily::Cm3Like, "nope.dat"), None);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn escaping_names_refused() {
        let root = scratch_store("escape");
        let store = FsBlobProvider::new(&root);
        assert_eq!(
            store.read_blob(DeviceFamily::Cm4, "../raspberrypi/bootcode.bin"),
            None
        );
        assert_eq!(store.read_blob(DeviceFamily::Cm4, "/etc/passwd"), None);
        assert_eq!(store.read_blob(DeviceFamily::Cm4, ""), None);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn memory_provider_round_trip() {
        let store = MemoryBlobProvider::new();
        store.insert(DeviceFamily::Cm4, "start4.elf", b"elf".to_vec());
        assert_eq!(
            store.read_blob(DeviceFamily::Cm4, "start4.elf"),
            Some(b"elf".to_vec())
        );
        assert_eq!(store.read_blob(DeviceFamily::Cm3Like, "start4.elf"), None);
    }
}
