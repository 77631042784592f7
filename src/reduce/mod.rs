//! Multi-round reductions driven by a [`Partners`] protocol.
//!
//! [`reduce`] runs the callback for rounds `0..=partners.rounds()`. In round
//! `r` a block is visited only if `partners.active(r, gid)`; it finds the
//! messages sent to it in round `r - 1` on its in-link
//! (`incoming(r, gid)`) and may enqueue for its out-link
//! (`outgoing(r, gid)`). Rounds are separated by an exchange scoped to the
//! out-links. The last round has no out-link; it is where the roots observe
//! the result.
//!
//! Partner sets may contain the block itself. Callbacks that do not want a
//! self-message skip it explicitly.

pub mod partners;

pub use partners::{
    AllToAllPartners, DimK, RegularAllReducePartners, RegularMergePartners, RegularPartners,
    RegularSwapPartners,
};

use crate::algs::communicator::Communicator;
use crate::block_error::BlockError;
use crate::master::Master;
use crate::master::proxy::Proxy;
use crate::partitioning::assigner::Assigner;
use crate::topology::gid::{BlockId, Gid};
use crate::topology::link::{Link, LinkTopology};
use std::ops::{Deref, DerefMut};

/// Communication pattern of a multi-round reduction.
pub trait Partners: Sync {
    fn rounds(&self) -> usize;

    /// Whether `gid` takes part in `round`.
    fn active(&self, round: usize, gid: Gid) -> bool;

    /// Gids that sent to `gid` in `round - 1`. Only asked for active blocks.
    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid>;

    /// Gids `gid` sends to in `round`. Only asked for active blocks and
    /// `round < rounds()`.
    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid>;
}

/// Proxy handed to reduction callbacks: the block's regular proxy plus this
/// round's partner links.
pub struct ReduceProxy<'a, L> {
    proxy: Proxy<'a, L>,
    round: usize,
    in_link: Link,
    out_link: Link,
    nblocks: usize,
}

impl<'a, L> ReduceProxy<'a, L> {
    pub fn round(&self) -> usize {
        self.round
    }

    /// Blocks whose messages for this block arrived in this round.
    pub fn in_link(&self) -> &Link {
        &self.in_link
    }

    /// Blocks to send to in this round.
    pub fn out_link(&self) -> &Link {
        &self.out_link
    }

    /// Total number of blocks, as known to the assigner.
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }
}

impl<'a, L> Deref for ReduceProxy<'a, L> {
    type Target = Proxy<'a, L>;
    fn deref(&self) -> &Self::Target {
        &self.proxy
    }
}

impl<'a, L> DerefMut for ReduceProxy<'a, L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.proxy
    }
}

fn partner_link(assigner: &dyn Assigner, gids: &[Gid]) -> Result<Link, BlockError> {
    gids.iter()
        .map(|&gid| Ok(BlockId::new(gid, assigner.rank(gid)?)))
        .collect::<Result<Vec<_>, BlockError>>()
        .map(|ids| ids.into_iter().collect())
}

/// Run a multi-round reduction over the blocks of `master`.
///
/// Collective: every rank calls it with equivalent `assigner` and `partners`.
pub fn reduce<B, C, L, P, F>(
    master: &mut Master<B, C, L>,
    assigner: &dyn Assigner,
    partners: &P,
    f: F,
) -> Result<(), BlockError>
where
    B: Send,
    C: Communicator,
    L: LinkTopology,
    P: Partners + ?Sized,
    F: Fn(&mut B, &mut ReduceProxy<'_, L>, &P) -> Result<(), BlockError> + Sync,
{
    let rounds = partners.rounds();
    for round in 0..=rounds {
        let select: Vec<bool> = master
            .gids()
            .into_iter()
            .map(|gid| partners.active(round, gid))
            .collect();
        let visited = master.visit(&select, |block, view| {
            let gid = view.gid;
            let incoming = if round > 0 {
                partners.incoming(round, gid)
            } else {
                Vec::new()
            };
            let outgoing = if round < rounds {
                partners.outgoing(round, gid)
            } else {
                Vec::new()
            };
            let mut proxy = ReduceProxy {
                proxy: view.into_proxy(),
                round,
                in_link: partner_link(assigner, &incoming)?,
                out_link: partner_link(assigner, &outgoing)?,
                nblocks: assigner.nblocks(),
            };
            f(block, &mut proxy, partners)?;
            for target in proxy.out_link.unique_targets() {
                proxy.proxy.touch(target);
            }
            Ok(())
        })?;
        log::debug!(
            "[rank {}] reduce round {round}/{rounds}: {} active blocks",
            master.comm().rank(),
            visited.len()
        );
        if round < rounds {
            master.exchange_queues(false)?;
        }
    }
    Ok(())
}
