//! Durable registry snapshot with flock discipline.
//!
//! The snapshot is a single JSON document holding every record plus the
//! role pointers. Two rules keep it safe under concurrent access and
//! crashes:
//!
//! - **Atomic replace**: `save` writes a temporary file next to the
//!   snapshot, fsyncs it, renames it over the snapshot, and fsyncs the
//!   directory. An external reader either sees the old file or the new
//!   one, never a partial write.
//! - **Lock file**: writers hold an exclusive `flock` on a sidecar lock
//!   file for the whole load-modify-save cycle; readers take a shared
//!   lock for the duration of a snapshot read. The lock lives on a
//!   separate file so the rename does not invalidate it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

use super::{DomainRegistry, RegistryError, RegistrySnapshot};

/// Maximum snapshot size accepted on load (16 MiB). A corrupted or
/// malicious snapshot larger than this is rejected before being read
/// into memory.
const MAX_SNAPSHOT_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from snapshot I/O.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying filesystem error.
    #[error("registry store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds a conflicting lock.
    #[error("registry store is locked by another process: {path}")]
    Locked {
        /// The lock file path.
        path: PathBuf,
    },

    /// The snapshot is not valid JSON.
    #[error("failed to parse registry snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    /// The snapshot parsed but violates a registry invariant.
    #[error("corrupt registry snapshot: {0}")]
    Corrupt(#[from] RegistryError),

    /// The snapshot file exceeds the size limit.
    #[error("registry snapshot exceeds maximum size ({size} > {MAX_SNAPSHOT_SIZE})")]
    TooLarge {
        /// Actual file size in bytes.
        size: u64,
    },

    /// A write was attempted under a shared (read) lock.
    #[error("registry save requires an exclusive lock")]
    SharedLock,
}

/// Guard for a held store lock. The flock is released when the guard is
/// dropped (closing the lock file releases it).
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    exclusive: bool,
}

impl StoreLock {
    /// Whether this guard holds the exclusive (writer) lock.
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Best effort; close releases the lock regardless.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Handle to the snapshot file on disk.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Create a handle for the snapshot at `path`. Nothing is touched on
    /// disk until a lock is taken.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn open_lock_file(&self) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        Ok(file)
    }

    /// Take the exclusive writer lock, blocking until it is free. Hold
    /// the guard for the whole load-modify-save cycle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the lock file cannot be opened or
    /// locked.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        let file = self.open_lock_file()?;
        FileExt::lock_exclusive(&file)?;
        Ok(StoreLock {
            file,
            exclusive: true,
        })
    }

    /// Take the exclusive writer lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds any lock
    /// on the store.
    pub fn try_lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        let file = self.open_lock_file()?;
        FileExt::try_lock_exclusive(&file).map_err(|_| StoreError::Locked {
            path: self.lock_path(),
        })?;
        Ok(StoreLock {
            file,
            exclusive: true,
        })
    }

    /// Take a shared reader lock, blocking until no writer holds the
    /// exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the lock file cannot be opened or
    /// locked.
    pub fn lock_shared(&self) -> Result<StoreLock, StoreError> {
        let file = self.open_lock_file()?;
        FileExt::lock_shared(&file)?;
        Ok(StoreLock {
            file,
            exclusive: false,
        })
    }

    /// Write the registry snapshot atomically. Requires the exclusive
    /// lock.
    ///
    /// # Errors
    ///
    /// - [`StoreError::SharedLock`] if `lock` is not exclusive
    /// - [`StoreError::Io`] / [`StoreError::Parse`] on write or
    ///   serialization failure
    pub fn save(&self, registry: &DomainRegistry, lock: &StoreLock) -> Result<(), StoreError> {
        self.save_snapshot(&registry.snapshot(), lock)
    }

    /// Write an already-taken snapshot atomically. Requires the
    /// exclusive lock.
    ///
    /// # Errors
    ///
    /// Same as [`Self::save`].
    pub fn save_snapshot(
        &self,
        snapshot: &RegistrySnapshot,
        lock: &StoreLock,
    ) -> Result<(), StoreError> {
        if !lock.is_exclusive() {
            return Err(StoreError::SharedLock);
        }
        let data = serde_json::to_vec_pretty(snapshot)?;

        let tmp_path = self.tmp_path();
        {
            let mut options = OpenOptions::new();
            options.create(true).write(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                // Owner-only: the snapshot enumerates every domain.
                options.mode(0o600);
            }
            let mut tmp = options.open(&tmp_path)?;
            tmp.write_all(&data)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.sync_parent_dir()?;
        debug!(path = %self.path.display(), domains = snapshot.domains.len(), "registry persisted");
        Ok(())
    }

    /// Load and validate the snapshot. Any lock (shared or exclusive)
    /// suffices.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TooLarge`] if the file exceeds the size limit
    /// - [`StoreError::Parse`] if the file is not valid JSON
    /// - [`StoreError::Corrupt`] if the content violates a registry
    ///   invariant
    pub fn load(&self, _lock: &StoreLock) -> Result<DomainRegistry, StoreError> {
        let mut file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        if size > MAX_SNAPSHOT_SIZE {
            return Err(StoreError::TooLarge { size });
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_SNAPSHOT_SIZE
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&data)?;
        let registry = DomainRegistry::from_snapshot(snapshot)?;
        debug!(path = %self.path.display(), domains = registry.len(), "registry loaded");
        Ok(registry)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn sync_parent_dir(&self) -> Result<(), StoreError> {
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DomainKind, DomainName, DomainSpec};

    fn spec(name: &str, kind: DomainKind) -> DomainSpec {
        DomainSpec::new(DomainName::new(name).unwrap(), kind)
    }

    fn store_in(dir: &tempfile::TempDir) -> RegistryStore {
        RegistryStore::new(dir.path().join("domains.json"))
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut registry = DomainRegistry::new();
        let tpl = registry.add(spec("tpl", DomainKind::Template)).unwrap();
        registry
            .add(spec("work", DomainKind::Application).with_template(tpl))
            .unwrap();

        let lock = store.lock_exclusive().unwrap();
        store.save(&registry, &lock).unwrap();
        let restored = store.load(&lock).unwrap();
        assert_eq!(restored.len(), registry.len());
        assert_eq!(restored.get_by_name("work").unwrap().template, Some(tpl));
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let registry = DomainRegistry::new();
        let lock = store.lock_exclusive().unwrap();
        store.save(&registry, &lock).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(entries.contains(&"domains.json".to_string()));
        assert!(
            !entries.iter().any(|e| e.ends_with(".tmp")),
            "temp file left behind: {entries:?}"
        );
    }

    #[test]
    fn save_requires_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let registry = DomainRegistry::new();
        {
            let lock = store.lock_exclusive().unwrap();
            store.save(&registry, &lock).unwrap();
        }
        let shared = store.lock_shared().unwrap();
        assert!(matches!(
            store.save(&registry, &shared).unwrap_err(),
            StoreError::SharedLock
        ));
    }

    #[test]
    fn exclusive_lock_excludes_second_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let _held = store.try_lock_exclusive().unwrap();
        assert!(matches!(
            store.try_lock_exclusive().unwrap_err(),
            StoreError::Locked { .. }
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        drop(store.try_lock_exclusive().unwrap());
        assert!(store.try_lock_exclusive().is_ok());
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), b"{ not json").unwrap();
        let lock = store.lock_shared().unwrap();
        assert!(matches!(
            store.load(&lock).unwrap_err(),
            StoreError::Parse(_)
        ));
    }

    #[test]
    fn load_rejects_invariant_violations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        // two records sharing a name
        let json = r#"{
            "domains": [
                {"id": 1, "name": "a", "kind": "application",
                 "template": null, "network_provider": null,
                 "memory_target": 1048576, "memory_ceiling": 2097152,
                 "vcpu_count": 1},
                {"id": 2, "name": "a", "kind": "application",
                 "template": null, "network_provider": null,
                 "memory_target": 1048576, "memory_ceiling": 2097152,
                 "vcpu_count": 1}
            ],
            "roles": {}
        }"#;
        std::fs::write(store.path(), json).unwrap();
        let lock = store.lock_shared().unwrap();
        assert!(matches!(
            store.load(&lock).unwrap_err(),
            StoreError::Corrupt(RegistryError::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn add_then_remove_is_persisted_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut registry = DomainRegistry::new();
        let lock = store.lock_exclusive().unwrap();
        store.save(&registry, &lock).unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let id = registry.add(spec("scratch", DomainKind::Application)).unwrap();
        registry.remove(id).unwrap();
        store.save(&registry, &lock).unwrap();
        let after = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, after);
    }
}
