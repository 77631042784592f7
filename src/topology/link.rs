//! Per-block neighbor tables.
//!
//! A link is the ordered list of blocks a block talks to. The order is stable
//! for a given instance so callbacks can index neighbors; it carries no
//! meaning for the runtime. Self-loops are legal (periodic domains with a
//! single division along an axis produce them) and are left for callbacks to
//! skip.
//!
//! [`Link`] is the plain variant; [`RegularLink`] additionally records, per
//! neighbor, the direction it lies in, its bounds and whether it was reached
//! by wrapping around a periodic axis.

use crate::block_error::BlockError;
use crate::partitioning::assigner::Assigner;
use crate::topology::bounds::{Bounds, Coordinate};
use crate::topology::gid::{BlockId, Gid};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Index;

/// Common read interface of every link flavor.
pub trait LinkTopology:
    Clone + Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Neighbors in link order (duplicates possible).
    fn neighbors(&self) -> &[BlockId];

    /// Mutable access used to re-home neighbors after reassignment.
    fn neighbors_mut(&mut self) -> &mut [BlockId];

    /// Number of entries, counting duplicates.
    #[inline]
    fn size(&self) -> usize {
        self.neighbors().len()
    }

    #[inline]
    fn target(&self, i: usize) -> Option<BlockId> {
        self.neighbors().get(i).copied()
    }

    /// Position of the first entry for `gid`.
    fn find(&self, gid: Gid) -> Option<usize> {
        self.neighbors().iter().position(|b| b.gid == gid)
    }

    /// Distinct neighbor blocks, in first-seen order.
    fn unique_targets(&self) -> Vec<BlockId> {
        self.neighbors().iter().copied().unique().collect()
    }

    /// Number of distinct neighbor gids.
    fn size_unique(&self) -> usize {
        self.neighbors().iter().map(|b| b.gid).unique().count()
    }

    /// Recompute every neighbor's owning rank from `assigner`.
    fn fix(&mut self, assigner: &dyn Assigner) -> Result<(), BlockError> {
        for nbr in self.neighbors_mut() {
            nbr.proc = assigner.rank(nbr.gid)?;
        }
        Ok(())
    }
}

/// Plain neighbor list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    neighbors: Vec<BlockId>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_neighbor(&mut self, nbr: BlockId) {
        self.neighbors.push(nbr);
    }
}

impl FromIterator<BlockId> for Link {
    fn from_iter<I: IntoIterator<Item = BlockId>>(iter: I) -> Self {
        Link {
            neighbors: iter.into_iter().collect(),
        }
    }
}

impl LinkTopology for Link {
    fn neighbors(&self) -> &[BlockId] {
        &self.neighbors
    }
    fn neighbors_mut(&mut self) -> &mut [BlockId] {
        &mut self.neighbors
    }
}

/// Relative position of a neighbor: one entry in `{-1, 0, 1}` per axis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction(Vec<i32>);

impl Direction {
    pub fn new(components: Vec<i32>) -> Self {
        Direction(components)
    }

    /// All-zero direction of the given dimension.
    pub fn zero(dim: usize) -> Self {
        Direction(vec![0; dim])
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }

    pub fn opposite(&self) -> Self {
        Direction(self.0.iter().map(|c| -c).collect())
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }
}

impl Index<usize> for Direction {
    type Output = i32;
    fn index(&self, axis: usize) -> &i32 {
        &self.0[axis]
    }
}

/// Link produced by a regular grid decomposition.
///
/// All per-neighbor vectors are parallel to `neighbors`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegularLink<T> {
    dim: usize,
    core: Bounds<T>,
    bounds: Bounds<T>,
    neighbors: Vec<BlockId>,
    directions: Vec<Direction>,
    neighbor_bounds: Vec<Bounds<T>>,
    wrap: Vec<Direction>,
}

impl<T: Coordinate> RegularLink<T> {
    /// Empty link for a block with the given core and ghosted bounds.
    pub fn new(dim: usize, core: Bounds<T>, bounds: Bounds<T>) -> Self {
        RegularLink {
            dim,
            core,
            bounds,
            neighbors: Vec::new(),
            directions: Vec::new(),
            neighbor_bounds: Vec::new(),
            wrap: Vec::new(),
        }
    }

    /// Append a neighbor. `wrap` is non-zero on the axes crossed periodically.
    pub fn add_neighbor(
        &mut self,
        nbr: BlockId,
        direction: Direction,
        bounds: Bounds<T>,
        wrap: Direction,
    ) {
        self.neighbors.push(nbr);
        self.directions.push(direction);
        self.neighbor_bounds.push(bounds);
        self.wrap.push(wrap);
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bounds owned by the block, without ghosts.
    pub fn core(&self) -> &Bounds<T> {
        &self.core
    }

    /// Bounds including the ghost layer.
    pub fn bounds(&self) -> &Bounds<T> {
        &self.bounds
    }

    pub fn direction(&self, i: usize) -> Option<&Direction> {
        self.directions.get(i)
    }

    /// Neighbor index lying in direction `dir`, if any.
    pub fn direction_index(&self, dir: &Direction) -> Option<usize> {
        self.directions.iter().position(|d| d == dir)
    }

    /// Core bounds of neighbor `i`, shifted across periodic boundaries.
    pub fn neighbor_bounds(&self, i: usize) -> Option<&Bounds<T>> {
        self.neighbor_bounds.get(i)
    }

    pub fn wrap(&self, i: usize) -> Option<&Direction> {
        self.wrap.get(i)
    }
}

impl<T: Coordinate> LinkTopology for RegularLink<T> {
    fn neighbors(&self) -> &[BlockId] {
        &self.neighbors
    }
    fn neighbors_mut(&mut self) -> &mut [BlockId] {
        &mut self.neighbors
    }
}

impl<T: Coordinate> crate::debug_invariants::DebugInvariants for RegularLink<T> {
    const WHAT: &'static str = "RegularLink";

    fn validate_invariants(&self) -> Result<(), BlockError> {
        let n = self.neighbors.len();
        if self.directions.len() != n || self.neighbor_bounds.len() != n || self.wrap.len() != n {
            return Err(BlockError::Configuration(format!(
                "link tables out of sync: {n} neighbors, {} directions, {} bounds, {} wraps",
                self.directions.len(),
                self.neighbor_bounds.len(),
                self.wrap.len()
            )));
        }
        if let Some(d) = self.directions.iter().find(|d| d.dim() != self.dim) {
            return Err(BlockError::Configuration(format!(
                "direction {d:?} does not have {} axes",
                self.dim
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::assigner::RoundRobinAssigner;

    fn bid(g: usize, p: usize) -> BlockId {
        BlockId::new(Gid::new(g), p)
    }

    #[test]
    fn unique_counts_ignore_duplicates() {
        let link: Link = [bid(1, 0), bid(2, 0), bid(1, 0)].into_iter().collect();
        assert_eq!(link.size(), 3);
        assert_eq!(link.size_unique(), 2);
        assert_eq!(link.unique_targets(), vec![bid(1, 0), bid(2, 0)]);
        assert_eq!(link.find(Gid::new(2)), Some(1));
        assert_eq!(link.find(Gid::new(9)), None);
    }

    #[test]
    fn fix_rehomes_neighbors() {
        let mut link: Link = [bid(0, 7), bid(3, 7)].into_iter().collect();
        let a = RoundRobinAssigner::new(2, 4).unwrap();
        link.fix(&a).unwrap();
        assert_eq!(link.target(0), Some(bid(0, 0)));
        assert_eq!(link.target(1), Some(bid(3, 1)));
    }

    #[test]
    fn regular_link_lookup_by_direction() {
        use crate::debug_invariants::DebugInvariants;
        let b = Bounds::<i64>::new(vec![0, 0], vec![3, 3]).unwrap();
        let mut link = RegularLink::new(2, b.clone(), b.clone());
        link.add_neighbor(bid(1, 0), Direction::new(vec![1, 0]), b.clone(), Direction::zero(2));
        link.add_neighbor(bid(2, 0), Direction::new(vec![0, -1]), b, Direction::new(vec![0, -1]));
        assert!(link.validate_invariants().is_ok());
        assert_eq!(link.direction_index(&Direction::new(vec![0, -1])), Some(1));
        assert_eq!(link.direction(0).map(|d| d.opposite()), Some(Direction::new(vec![-1, 0])));
        assert!(!link.wrap(1).unwrap().is_zero());
    }
}
