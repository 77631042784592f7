#![cfg_attr(docsrs, feature(doc_cfg))]
//! # blockpar
//!
//! blockpar is a block-parallel runtime for scientific computing. A logical
//! domain is cut into blocks, blocks are assigned to processes, and user
//! callbacks run over the blocks of each process while the runtime moves
//! messages between them.
//!
//! ## Features
//! - Regular decomposition of discrete or continuous domains, with ghosts,
//!   periodic axes and neighbor links ([`partitioning`], [`topology`])
//! - A block container driving callbacks on a rayon pool ([`master`])
//! - Synchronous `exchange`, asynchronous `iexchange` with distributed
//!   termination detection, and multi-round `reduce` with merge, swap,
//!   all-reduce and all-to-all partners ([`reduce`])
//! - Out-of-core blocks with a pluggable eviction policy ([`storage`])
//! - Writing and re-reading all blocks under a different assignment ([`io`])
//! - Pluggable communication backends (serial, Rayon, MPI)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! blockpar = "0.3"
//! # features = ["mpi-support"]
//! ```
//!
//! ```
//! use blockpar::prelude::*;
//!
//! let domain = DiscreteBounds::new(vec![0], vec![15]).unwrap();
//! let decomposer = RegularDecomposer::new(domain, 4).unwrap();
//! let assigner = ContiguousAssigner::new(1, 4).unwrap();
//! let mut master: Master<i64, NoComm, RegularLink<i64>> = Master::new(NoComm);
//! decomposer
//!     .decompose(0, &assigner, |gid, core, _bounds, _domain, link| {
//!         master.add(gid, core.min[0], link).map(|_| ())
//!     })
//!     .unwrap();
//! master.exchange().unwrap();
//! assert_eq!(master.size(), 4);
//! ```
//!
//! ## Processes and threads
//!
//! Communicators are created explicitly and torn down when dropped. Threads
//! only ever run callbacks for distinct blocks at the same time.

pub mod algs;
pub mod block_error;
pub mod debug_invariants;
pub mod io;
pub mod master;
pub mod partitioning;
pub mod reduce;
pub mod storage;
pub mod topology;

pub use block_error::BlockError;
pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::block_error::BlockError;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::io::{read_blocks, write_blocks};
    pub use crate::master::collectives::{CollectiveValue, ReduceOp};
    pub use crate::master::proxy::{IProxy, Proxy};
    pub use crate::master::{Master, MasterConfig, NeverSkip, Skip, SkipNoIncoming};
    pub use crate::partitioning::assigner::{Assigner, ContiguousAssigner, RoundRobinAssigner};
    pub use crate::partitioning::decomposer::{DecomposerConfig, RegularDecomposer};
    pub use crate::reduce::{
        AllToAllPartners, Partners, ReduceProxy, RegularAllReducePartners, RegularMergePartners,
        RegularSwapPartners, reduce,
    };
    pub use crate::storage::{
        BlockCodec, EvictionPolicy, ExternalStorage, FileStorage, LeastRecentlyUsed,
        MemoryStorage, NeverEvict,
    };
    pub use crate::topology::bounds::{Bounds, ContinuousBounds, Coordinate, DiscreteBounds};
    pub use crate::topology::gid::{BlockId, Gid};
    pub use crate::topology::link::{Direction, Link, LinkTopology, RegularLink};
}
