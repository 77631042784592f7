//! `Gid` and `BlockId`: global block identity.
//!
//! A [`Gid`] names a block uniquely across the whole run; a [`BlockId`] pairs
//! it with the rank that currently owns the block, which is what message
//! routing needs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global block identifier, stable within a run.
///
/// Unlike mesh point ids, `0` is a perfectly valid gid: decompositions number
/// blocks `0..nblocks`.
#[derive(
    Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Gid(usize);

impl Gid {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Gid(raw)
    }

    /// Raw integer value.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl From<usize> for Gid {
    #[inline]
    fn from(raw: usize) -> Self {
        Gid(raw)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self.0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block together with the rank that owns it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub gid: Gid,
    pub proc: usize,
}

impl BlockId {
    #[inline]
    pub const fn new(gid: Gid, proc: usize) -> Self {
        BlockId { gid, proc }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gid, self.proc)
    }
}
