//! Out-of-core support: where externalized blocks go and which blocks leave.
//!
//! A [`Master`](crate::master::Master) with attached storage keeps at most
//! the eviction policy's limit of blocks in memory. Externalized payloads are
//! produced by a [`BlockCodec`] and handed to an [`ExternalStorage`], which
//! returns an opaque [`StorageKey`]. A payload is destroyed only after the
//! block it holds has been decoded again.

mod codec;
mod eviction;
mod file;
mod memory;

pub use codec::BlockCodec;
pub use eviction::{EvictionPolicy, LeastRecentlyUsed, NeverEvict, ResidentBlock};
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::block_error::BlockError;
use std::fmt::Debug;

/// Handle to one externalized payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(pub u64);

/// Byte store for externalized blocks.
///
/// Implementations are shared with worker threads, so every method takes
/// `&self`.
pub trait ExternalStorage: Send + Sync + Debug {
    /// Store `bytes` and return the key that retrieves them.
    fn put(&self, bytes: &[u8]) -> Result<StorageKey, BlockError>;

    /// Read the payload stored under `key`; it stays stored.
    fn get(&self, key: StorageKey) -> Result<Vec<u8>, BlockError>;

    /// Forget the payload under `key`.
    fn destroy(&self, key: StorageKey) -> Result<(), BlockError>;

    /// Number of payloads currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn ExternalStorage) {
        let a = storage.put(b"alpha").unwrap();
        let b = storage.put(b"").unwrap();
        assert_ne!(a, b);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get(a).unwrap(), b"alpha");
        assert_eq!(storage.get(a).unwrap(), b"alpha");
        storage.destroy(a).unwrap();
        assert!(storage.get(a).is_err());
        storage.destroy(b).unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn memory_storage_contract() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn file_storage_contract() {
        let dir = std::env::temp_dir().join(format!("blockpar-storage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let storage = FileStorage::new(dir.join("contract"));
        exercise(&storage);
    }
}
