//! Block-to-rank assignment policies.
//!
//! An [`Assigner`] is a pure function of `(nblocks, size)`: `rank(gid)` and
//! `local_gids(rank)` are mutual inverses and never change between calls, so
//! the decomposer, the exchange routing and the reduce driver all agree on
//! ownership without talking to each other.

use crate::block_error::BlockError;
use crate::topology::gid::Gid;

/// Maps gids to owning ranks.
pub trait Assigner: Send + Sync {
    /// Number of ranks.
    fn size(&self) -> usize;

    /// Total number of blocks.
    fn nblocks(&self) -> usize;

    /// Owning rank of `gid`.
    ///
    /// Fails with [`BlockError::AssignmentMismatch`] for gids outside
    /// `0..nblocks`.
    fn rank(&self, gid: Gid) -> Result<usize, BlockError>;

    /// Gids owned by `rank`, ascending.
    fn local_gids(&self, rank: usize) -> Vec<Gid>;
}

fn check_size(size: usize) -> Result<(), BlockError> {
    if size == 0 {
        return Err(BlockError::Configuration(
            "assigner needs at least one rank".into(),
        ));
    }
    Ok(())
}

fn out_of_range(gid: Gid, nblocks: usize) -> BlockError {
    BlockError::AssignmentMismatch(format!(
        "gid {gid} is outside the assigned range 0..{nblocks}"
    ))
}

/// Consecutive gid ranges per rank; the first `nblocks % size` ranks own one
/// extra block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContiguousAssigner {
    size: usize,
    nblocks: usize,
}

impl ContiguousAssigner {
    pub fn new(size: usize, nblocks: usize) -> Result<Self, BlockError> {
        check_size(size)?;
        Ok(Self { size, nblocks })
    }

    fn range(&self, rank: usize) -> std::ops::Range<usize> {
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        if rank >= self.size {
            return 0..0;
        }
        let from = if rank < rem {
            rank * (div + 1)
        } else {
            rem * (div + 1) + (rank - rem) * div
        };
        let len = div + usize::from(rank < rem);
        from..from + len
    }
}

impl Assigner for ContiguousAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Result<usize, BlockError> {
        let g = gid.get();
        if g >= self.nblocks {
            return Err(out_of_range(gid, self.nblocks));
        }
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        let r = g / (div + 1);
        if r < rem {
            Ok(r)
        } else {
            // div > 0 here: with div == 0 every valid gid satisfies r < rem.
            Ok(rem + (g - (div + 1) * rem) / div)
        }
    }

    fn local_gids(&self, rank: usize) -> Vec<Gid> {
        self.range(rank).map(Gid::new).collect()
    }
}

/// `gid % size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundRobinAssigner {
    size: usize,
    nblocks: usize,
}

impl RoundRobinAssigner {
    pub fn new(size: usize, nblocks: usize) -> Result<Self, BlockError> {
        check_size(size)?;
        Ok(Self { size, nblocks })
    }
}

impl Assigner for RoundRobinAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Result<usize, BlockError> {
        if gid.get() >= self.nblocks {
            return Err(out_of_range(gid, self.nblocks));
        }
        Ok(gid.get() % self.size)
    }

    fn local_gids(&self, rank: usize) -> Vec<Gid> {
        if rank >= self.size {
            return Vec::new();
        }
        (rank..self.nblocks).step_by(self.size).map(Gid::new).collect()
    }
}
