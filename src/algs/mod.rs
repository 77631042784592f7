//! Message-passing substrate shared by the exchange protocols.

pub mod communicator;
pub mod wire;
