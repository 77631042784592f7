//! BlockError: unified error type for blockpar public APIs
//!
//! Every fallible operation of the runtime (decomposition, block registration,
//! queue access, exchange, reduction, storage and block files) reports through
//! this one enum so callers can propagate with `?` across subsystems.

use crate::topology::gid::Gid;
use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for block-parallel operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Invalid block count, factorization, dimensionality or runtime setup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// `Master::add` was called with a gid that is already registered.
    #[error("block {0} is already registered with this master")]
    DuplicateGid(Gid),
    /// `dequeue` on an empty incoming queue.
    #[error("queue underflow: block {gid} has no pending message from block {from}")]
    QueueUnderflow { gid: Gid, from: Gid },
    /// A gid was addressed on a process that does not own it.
    #[error("block {0} is not registered on this process")]
    UnknownBlock(Gid),
    /// A block had to be in memory but is externalized and cannot be loaded.
    #[error("block {0} is not resident and no storage is attached")]
    NotResident(Gid),
    /// The assigner cannot place a gid, or disagrees with persisted blocks.
    #[error("assignment mismatch: {0}")]
    AssignmentMismatch(String),
    /// Storage backend failed on a specific path.
    #[error("storage error at {path:?}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Payload, hook or metadata (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// Persisted block file is truncated or inconsistent.
    #[error("malformed block file: {0}")]
    MalformedFile(String),
    /// Transport delivered nothing, or something unexpected, from a rank.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// User callback reported a failure.
    #[error("callback failed: {0}")]
    Callback(String),
}

impl From<bincode::Error> for BlockError {
    fn from(e: bincode::Error) -> Self {
        BlockError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for BlockError {
    fn from(e: serde_json::Error) -> Self {
        BlockError::Codec(e.to_string())
    }
}

impl BlockError {
    /// Shorthand for a [`BlockError::CommError`] with a plain message.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        BlockError::CommError {
            neighbor,
            source: msg.into().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_block() {
        let e = BlockError::QueueUnderflow {
            gid: Gid::new(3),
            from: Gid::new(7),
        };
        let s = e.to_string();
        assert!(s.contains("block 3"));
        assert!(s.contains("block 7"));
    }

    #[test]
    fn bincode_errors_become_codec() {
        let r: Result<u64, _> = bincode::deserialize(&[1u8, 2]);
        let e: BlockError = r.unwrap_err().into();
        assert!(matches!(e, BlockError::Codec(_)));
    }
}
