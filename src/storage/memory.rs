use super::{ExternalStorage, StorageKey};
use crate::block_error::BlockError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keeps externalized payloads in a concurrent map; useful for tests and for
/// trading deserialized blocks for compact bytes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    next: AtomicU64,
    payloads: DashMap<StorageKey, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExternalStorage for MemoryStorage {
    fn put(&self, bytes: &[u8]) -> Result<StorageKey, BlockError> {
        let key = StorageKey(self.next.fetch_add(1, Ordering::Relaxed));
        self.payloads.insert(key, bytes.to_vec());
        Ok(key)
    }

    fn get(&self, key: StorageKey) -> Result<Vec<u8>, BlockError> {
        self.payloads
            .get(&key)
            .map(|v| v.value().clone())
            .ok_or_else(|| BlockError::Configuration(format!("no payload under {key:?}")))
    }

    fn destroy(&self, key: StorageKey) -> Result<(), BlockError> {
        self.payloads.remove(&key);
        Ok(())
    }

    fn len(&self) -> usize {
        self.payloads.len()
    }
}
