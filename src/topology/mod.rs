//! Block identities, bounds and neighbor links.

pub mod bounds;
pub mod gid;
pub mod link;
