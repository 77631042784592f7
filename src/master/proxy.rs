//! Communication handles passed to block callbacks.
//!
//! A [`Proxy`] borrows one block's queues for the duration of one callback
//! invocation. Typed payloads go through `bincode`; raw [`Bytes`] bypass it.
//! Messages enqueued for a block are delivered by the next `exchange` (or,
//! inside `iexchange`, as soon as the pass ends).

use crate::block_error::BlockError;
use crate::master::collectives::{BlockCollectives, CollectiveValue, ReduceOp};
use crate::master::queues::BlockQueues;
use crate::topology::gid::{BlockId, Gid};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ops::{Deref, DerefMut};

/// Per-block, per-invocation communication handle.
pub struct Proxy<'a, L> {
    gid: Gid,
    link: &'a L,
    queues: &'a mut BlockQueues,
    collectives: &'a mut BlockCollectives,
}

impl<'a, L> Proxy<'a, L> {
    pub(crate) fn new(
        gid: Gid,
        link: &'a L,
        queues: &'a mut BlockQueues,
        collectives: &'a mut BlockCollectives,
    ) -> Self {
        Proxy {
            gid,
            link,
            queues,
            collectives,
        }
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    #[inline]
    pub fn link(&self) -> &L {
        self.link
    }

    /// Serialize `value` and append it to the outgoing queue for `to`.
    pub fn enqueue<T: Serialize + ?Sized>(&mut self, to: BlockId, value: &T) -> Result<(), BlockError> {
        let bytes = bincode::serialize(value)?;
        self.queues.push_outgoing(to, Bytes::from(bytes));
        Ok(())
    }

    /// Make sure a batch, possibly empty, goes to `to` at the next exchange.
    pub(crate) fn touch(&mut self, to: BlockId) {
        self.queues.touch_outgoing(to);
    }

    pub fn enqueue_bytes(&mut self, to: BlockId, msg: impl Into<Bytes>) {
        self.queues.push_outgoing(to, msg.into());
    }

    /// Pop and deserialize the oldest message from `from`.
    ///
    /// Fails with [`BlockError::QueueUnderflow`] if nothing is queued.
    pub fn dequeue<T: DeserializeOwned>(&mut self, from: Gid) -> Result<T, BlockError> {
        let bytes = self.dequeue_bytes(from)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn dequeue_bytes(&mut self, from: Gid) -> Result<Bytes, BlockError> {
        self.queues
            .pop_incoming(from)
            .ok_or(BlockError::QueueUnderflow {
                gid: self.gid,
                from,
            })
    }

    /// Whether a message from `from` is waiting.
    #[inline]
    pub fn incoming(&self, from: Gid) -> bool {
        self.queues.incoming_len(from) > 0
    }

    pub fn incoming_len(&self, from: Gid) -> usize {
        self.queues.incoming_len(from)
    }

    /// Sources with unread messages, ascending.
    pub fn incoming_gids(&self) -> Vec<Gid> {
        self.queues.incoming_sources()
    }

    /// Contribute to the next positional all-reduce.
    pub fn all_reduce(&mut self, value: impl Into<CollectiveValue>, op: ReduceOp) {
        self.collectives.post(op, value.into());
    }

    /// Result of the i-th all-reduce resolved by the last exchange.
    pub fn collective(&self, i: usize) -> Option<CollectiveValue> {
        self.collectives.result(i)
    }
}

/// Source of messages that arrive while an asynchronous exchange is running.
pub(crate) trait FillIncoming: Sync {
    /// Move everything that has arrived for `gid` into `queues`.
    fn fill(&self, gid: Gid, queues: &mut BlockQueues) -> Result<bool, BlockError>;
}

/// Proxy handed to `iexchange` callbacks.
pub struct IProxy<'a, L> {
    proxy: Proxy<'a, L>,
    inbox: &'a dyn FillIncoming,
}

impl<'a, L> IProxy<'a, L> {
    pub(crate) fn new(proxy: Proxy<'a, L>, inbox: &'a dyn FillIncoming) -> Self {
        IProxy { proxy, inbox }
    }

    /// Pull in whatever has already arrived for this block without waiting.
    /// Returns whether anything new showed up.
    pub fn fill_incoming(&mut self) -> Result<bool, BlockError> {
        let gid = self.proxy.gid;
        self.inbox.fill(gid, self.proxy.queues)
    }
}

impl<'a, L> Deref for IProxy<'a, L> {
    type Target = Proxy<'a, L>;
    fn deref(&self) -> &Self::Target {
        &self.proxy
    }
}

impl<'a, L> DerefMut for IProxy<'a, L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.proxy
    }
}
