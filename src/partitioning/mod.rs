//! Splitting a domain into blocks and handing blocks to ranks.
//!
//! - [`decomposer`] cuts a regular domain into a grid of blocks and builds
//!   each block's bounds and neighbor link.
//! - [`assigner`] decides which rank owns which gid.

pub mod assigner;
pub mod decomposer;
