//! Which resident blocks to externalize.

use crate::topology::gid::Gid;
use std::fmt::Debug;

/// A resident block as seen by an [`EvictionPolicy`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResidentBlock {
    pub index: usize,
    pub gid: Gid,
    /// Logical time of the last load or callback.
    pub last_used: u64,
}

pub trait EvictionPolicy: Send + Sync + Debug {
    /// Resident blocks allowed at once, if bounded.
    fn limit(&self) -> Option<usize>;

    /// Local indices to externalize, given the currently resident blocks.
    fn victims(&self, resident: &[ResidentBlock]) -> Vec<usize>;
}

/// Everything stays in memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn limit(&self) -> Option<usize> {
        None
    }

    fn victims(&self, _resident: &[ResidentBlock]) -> Vec<usize> {
        Vec::new()
    }
}

/// Keep at most `limit` blocks, dropping the least recently used first.
#[derive(Copy, Clone, Debug)]
pub struct LeastRecentlyUsed {
    limit: usize,
}

impl LeastRecentlyUsed {
    pub fn new(limit: usize) -> Self {
        LeastRecentlyUsed { limit }
    }
}

impl EvictionPolicy for LeastRecentlyUsed {
    fn limit(&self) -> Option<usize> {
        Some(self.limit)
    }

    fn victims(&self, resident: &[ResidentBlock]) -> Vec<usize> {
        let excess = resident.len().saturating_sub(self.limit);
        let mut by_age: Vec<&ResidentBlock> = resident.iter().collect();
        by_age.sort_by_key(|r| (r.last_used, r.index));
        by_age.into_iter().take(excess).map(|r| r.index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_picks_oldest_excess() {
        let resident: Vec<ResidentBlock> = [(0, 7), (1, 3), (2, 9), (3, 1)]
            .into_iter()
            .map(|(index, last_used)| ResidentBlock {
                index,
                gid: Gid::new(index),
                last_used,
            })
            .collect();
        assert_eq!(LeastRecentlyUsed::new(2).victims(&resident), vec![3, 1]);
        assert!(LeastRecentlyUsed::new(4).victims(&resident).is_empty());
        assert!(NeverEvict.victims(&resident).is_empty());
    }
}
