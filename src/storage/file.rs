use super::{ExternalStorage, StorageKey};
use crate::block_error::BlockError;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

// Distinguishes several stores sharing a prefix inside one process.
static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// One file per payload, named `{prefix}.{pid}.{instance}.{key}`.
///
/// Files left over when the store is dropped are removed.
#[derive(Debug)]
pub struct FileStorage {
    stem: String,
    next: AtomicU64,
    files: DashMap<StorageKey, PathBuf>,
}

impl FileStorage {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        let prefix: PathBuf = prefix.into();
        let instance = INSTANCES.fetch_add(1, Ordering::Relaxed);
        FileStorage {
            stem: format!("{}.{}.{instance}", prefix.display(), std::process::id()),
            next: AtomicU64::new(0),
            files: DashMap::new(),
        }
    }

    fn path(&self, key: StorageKey) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.stem, key.0))
    }
}

impl ExternalStorage for FileStorage {
    fn put(&self, bytes: &[u8]) -> Result<StorageKey, BlockError> {
        let key = StorageKey(self.next.fetch_add(1, Ordering::Relaxed));
        let path = self.path(key);
        std::fs::write(&path, bytes).map_err(|source| BlockError::StorageIo {
            path: path.clone(),
            source,
        })?;
        self.files.insert(key, path);
        Ok(key)
    }

    fn get(&self, key: StorageKey) -> Result<Vec<u8>, BlockError> {
        let path = self
            .files
            .get(&key)
            .map(|p| p.value().clone())
            .ok_or_else(|| BlockError::Configuration(format!("no payload under {key:?}")))?;
        std::fs::read(&path).map_err(|source| BlockError::StorageIo { path, source })
    }

    fn destroy(&self, key: StorageKey) -> Result<(), BlockError> {
        if let Some((_, path)) = self.files.remove(&key) {
            std::fs::remove_file(&path).map_err(|source| BlockError::StorageIo { path, source })?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        for entry in self.files.iter() {
            if let Err(e) = std::fs::remove_file(entry.value()) {
                log::warn!("could not remove {}: {e}", entry.value().display());
            }
        }
    }
}
