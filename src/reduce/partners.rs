//! Built-in [`Partners`] for regular block grids.
//!
//! [`RegularPartners`] factors every axis of the block grid into groups of at
//! most `k` blocks and interleaves the axes into rounds: round `r` groups
//! blocks along axis `kvs[r].dim` in groups of `kvs[r].size`. The merge, swap
//! and all-reduce patterns are different readings of the same groups.

use super::Partners;
use crate::block_error::BlockError;
use crate::partitioning::decomposer::{
    RegularDecomposer, coords_to_gid, fill_divisions, gid_to_coords,
};
use crate::topology::bounds::Coordinate;
use crate::topology::gid::Gid;

/// Group size of one round and the axis it runs along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimK {
    pub dim: usize,
    pub size: usize,
}

/// Round structure shared by the regular partner patterns.
///
/// `contiguous` groups neighboring blocks first (useful when data is united);
/// otherwise groups are strided, which suits vector halving.
#[derive(Clone, Debug)]
pub struct RegularPartners {
    divisions: Vec<usize>,
    kvs: Vec<DimK>,
    contiguous: bool,
}

fn check_k(k: usize) -> Result<(), BlockError> {
    if k < 2 {
        return Err(BlockError::Configuration(format!(
            "group size k must be at least 2, got {k}"
        )));
    }
    Ok(())
}

impl RegularPartners {
    /// Partners for `nblocks` blocks split over `dim` axes the way the
    /// regular decomposer splits them.
    pub fn new(dim: usize, nblocks: usize, k: usize, contiguous: bool) -> Result<Self, BlockError> {
        check_k(k)?;
        if dim == 0 {
            return Err(BlockError::Configuration("partners need at least one axis".into()));
        }
        let divisions = fill_divisions(nblocks, &vec![0; dim])?;
        Ok(Self::with_kvs(divisions.clone(), Self::factor(k, &divisions), contiguous))
    }

    /// Partners over the block grid of `decomposer`.
    pub fn from_decomposer<T: Coordinate>(
        decomposer: &RegularDecomposer<T>,
        k: usize,
        contiguous: bool,
    ) -> Result<Self, BlockError> {
        check_k(k)?;
        let divisions = decomposer.divisions().to_vec();
        Ok(Self::with_kvs(divisions.clone(), Self::factor(k, &divisions), contiguous))
    }

    pub fn with_kvs(divisions: Vec<usize>, kvs: Vec<DimK>, contiguous: bool) -> Self {
        RegularPartners {
            divisions,
            kvs,
            contiguous,
        }
    }

    /// Factor each axis into group sizes of at most `k` and interleave the
    /// axes round-robin.
    pub fn factor(k: usize, divisions: &[usize]) -> Vec<DimK> {
        let per_axis: Vec<Vec<usize>> = divisions.iter().map(|&d| factor_axis(k, d)).collect();
        let mut next = vec![0usize; divisions.len()];
        let mut kvs = Vec::new();
        loop {
            let mut changed = false;
            for (dim, sizes) in per_axis.iter().enumerate() {
                if let Some(&size) = sizes.get(next[dim]) {
                    kvs.push(DimK { dim, size });
                    next[dim] += 1;
                    changed = true;
                }
            }
            if !changed {
                return kvs;
            }
        }
    }

    pub fn rounds(&self) -> usize {
        self.kvs.len()
    }

    /// Group size in `round`.
    pub fn size(&self, round: usize) -> Option<usize> {
        self.kvs.get(round).map(|kv| kv.size)
    }

    /// Axis of `round`.
    pub fn dim(&self, round: usize) -> Option<usize> {
        self.kvs.get(round).map(|kv| kv.dim)
    }

    pub fn divisions(&self) -> &[usize] {
        &self.divisions
    }

    pub fn kvs(&self) -> &[DimK] {
        &self.kvs
    }

    /// Coordinate distance between group members in `round`.
    fn step(&self, round: usize) -> usize {
        let kv = self.kvs[round];
        if self.contiguous {
            self.kvs[..round]
                .iter()
                .filter(|r| r.dim == kv.dim)
                .map(|r| r.size)
                .product()
        } else {
            let through: usize = self.kvs[..=round]
                .iter()
                .filter(|r| r.dim == kv.dim)
                .map(|r| r.size)
                .product();
            self.divisions[kv.dim] / through
        }
    }

    /// Position of coordinate `c` within its group in `round`.
    pub fn group_position(&self, round: usize, c: usize, step: usize) -> usize {
        c / step % self.kvs[round].size
    }

    /// All members of `gid`'s group in `round`, ascending along the round's
    /// axis; the first one is the group root.
    pub fn fill(&self, round: usize, gid: Gid) -> Vec<Gid> {
        let Some(kv) = self.kvs.get(round).copied() else {
            return Vec::new();
        };
        let step = self.step(round);
        let mut coords = gid_to_coords(gid, &self.divisions);
        let c = coords[kv.dim];
        let first = c - self.group_position(round, c, step) * step;
        (0..kv.size)
            .map(|i| {
                coords[kv.dim] = first + i * step;
                coords_to_gid(&coords, &self.divisions)
            })
            .collect()
    }

    /// Whether `gid` was a group root in every round before `round`.
    fn root_through(&self, round: usize, gid: Gid) -> bool {
        let coords = gid_to_coords(gid, &self.divisions);
        (0..round.min(self.rounds()))
            .all(|r| self.group_position(r, coords[self.kvs[r].dim], self.step(r)) == 0)
    }
}

/// Group sizes for one axis with `n` divisions: `k` while it divides, then
/// the largest smaller divisor, then whatever prime is left.
fn factor_axis(k: usize, n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut rem = n;
    while rem > 1 {
        if rem % k == 0 {
            out.push(k);
            rem /= k;
            continue;
        }
        match (2..k).rev().find(|j| rem % j == 0) {
            Some(j) => {
                out.push(j);
                rem /= j;
            }
            None => {
                out.push(rem);
                rem = 1;
            }
        }
    }
    out
}

/// k-ary merge tree: each round, every group sends to its root; after the
/// last round gid 0 holds the result.
#[derive(Clone, Debug)]
pub struct RegularMergePartners(RegularPartners);

impl RegularMergePartners {
    pub fn new(dim: usize, nblocks: usize, k: usize, contiguous: bool) -> Result<Self, BlockError> {
        RegularPartners::new(dim, nblocks, k, contiguous).map(Self)
    }

    pub fn from_decomposer<T: Coordinate>(
        decomposer: &RegularDecomposer<T>,
        k: usize,
        contiguous: bool,
    ) -> Result<Self, BlockError> {
        RegularPartners::from_decomposer(decomposer, k, contiguous).map(Self)
    }

    pub fn regular(&self) -> &RegularPartners {
        &self.0
    }
}

impl Partners for RegularMergePartners {
    fn rounds(&self) -> usize {
        self.0.rounds()
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        if round == self.rounds() {
            return gid == Gid::new(0);
        }
        self.0.root_through(round, gid)
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        match round {
            0 => Vec::new(),
            r => self.0.fill(r - 1, gid),
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        self.0.fill(round, gid).into_iter().take(1).collect()
    }
}

/// Every block stays active; each round, group members swap with everyone in
/// their group.
#[derive(Clone, Debug)]
pub struct RegularSwapPartners(RegularPartners);

impl RegularSwapPartners {
    pub fn new(dim: usize, nblocks: usize, k: usize, contiguous: bool) -> Result<Self, BlockError> {
        RegularPartners::new(dim, nblocks, k, contiguous).map(Self)
    }

    pub fn from_decomposer<T: Coordinate>(
        decomposer: &RegularDecomposer<T>,
        k: usize,
        contiguous: bool,
    ) -> Result<Self, BlockError> {
        RegularPartners::from_decomposer(decomposer, k, contiguous).map(Self)
    }

    pub fn regular(&self) -> &RegularPartners {
        &self.0
    }
}

impl Partners for RegularSwapPartners {
    fn rounds(&self) -> usize {
        self.0.rounds()
    }

    fn active(&self, _round: usize, _gid: Gid) -> bool {
        true
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        match round {
            0 => Vec::new(),
            r => self.0.fill(r - 1, gid),
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        self.0.fill(round, gid)
    }
}

/// A merge up the tree followed by its mirror image back down, so every
/// block ends with the root's result.
#[derive(Clone, Debug)]
pub struct RegularAllReducePartners(RegularMergePartners);

impl RegularAllReducePartners {
    pub fn new(dim: usize, nblocks: usize, k: usize, contiguous: bool) -> Result<Self, BlockError> {
        RegularMergePartners::new(dim, nblocks, k, contiguous).map(Self)
    }

    pub fn from_decomposer<T: Coordinate>(
        decomposer: &RegularDecomposer<T>,
        k: usize,
        contiguous: bool,
    ) -> Result<Self, BlockError> {
        RegularMergePartners::from_decomposer(decomposer, k, contiguous).map(Self)
    }

    /// Merge round that `round` mirrors.
    pub fn parent_round(&self, round: usize) -> usize {
        let up = self.0.rounds();
        if round < up { round } else { 2 * up - round }
    }
}

impl Partners for RegularAllReducePartners {
    fn rounds(&self) -> usize {
        2 * self.0.rounds()
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        self.0.active(self.parent_round(round), gid)
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round <= self.0.rounds() {
            self.0.incoming(round, gid)
        } else {
            self.0.outgoing(self.parent_round(round), gid)
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round < self.0.rounds() {
            self.0.outgoing(round, gid)
        } else {
            self.0.incoming(self.parent_round(round), gid)
        }
    }
}

/// One round in which every block sends to and hears from every block.
#[derive(Clone, Copy, Debug)]
pub struct AllToAllPartners {
    nblocks: usize,
}

impl AllToAllPartners {
    pub fn new(nblocks: usize) -> Self {
        AllToAllPartners { nblocks }
    }

    fn everyone(&self) -> Vec<Gid> {
        (0..self.nblocks).map(Gid::new).collect()
    }
}

impl Partners for AllToAllPartners {
    fn rounds(&self) -> usize {
        1
    }

    fn active(&self, _round: usize, _gid: Gid) -> bool {
        true
    }

    fn incoming(&self, round: usize, _gid: Gid) -> Vec<Gid> {
        if round == 1 { self.everyone() } else { Vec::new() }
    }

    fn outgoing(&self, round: usize, _gid: Gid) -> Vec<Gid> {
        if round == 0 { self.everyone() } else { Vec::new() }
    }
}
