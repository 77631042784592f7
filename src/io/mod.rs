//! Block persistence.

pub mod blocks;

pub use blocks::{BlocksMetadata, read_blocks, write_blocks};
