//! Per-block message queues.
//!
//! Each resident block owns one outgoing queue per target block and one
//! incoming queue per source gid. Only that block's callback and the
//! runtime's delivery step touch them, so they need no locking.

use crate::topology::gid::{BlockId, Gid};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// FIFO of serialized messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageQueue {
    messages: VecDeque<Bytes>,
}

impl MessageQueue {
    #[inline]
    pub fn push(&mut self, msg: Bytes) {
        self.messages.push_back(msg);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Bytes> {
        self.messages.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Bytes> {
        self.messages.iter()
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Bytes>) {
        self.messages.extend(other);
    }
}

impl IntoIterator for MessageQueue {
    type Item = Bytes;
    type IntoIter = std::collections::vec_deque::IntoIter<Bytes>;
    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// Outgoing and incoming queues of one block.
#[derive(Debug, Default)]
pub struct BlockQueues {
    outgoing: BTreeMap<BlockId, MessageQueue>,
    incoming: BTreeMap<Gid, MessageQueue>,
}

impl BlockQueues {
    /// Make sure a (possibly empty) batch goes to `to` at the next exchange.
    pub fn touch_outgoing(&mut self, to: BlockId) {
        self.outgoing.entry(to).or_default();
    }

    pub fn push_outgoing(&mut self, to: BlockId, msg: Bytes) {
        self.outgoing.entry(to).or_default().push(msg);
    }

    pub fn pop_incoming(&mut self, from: Gid) -> Option<Bytes> {
        self.incoming.get_mut(&from).and_then(MessageQueue::pop)
    }

    pub fn incoming_len(&self, from: Gid) -> usize {
        self.incoming.get(&from).map_or(0, MessageQueue::len)
    }

    /// Gids with at least one unread message.
    pub fn incoming_sources(&self) -> Vec<Gid> {
        self.incoming
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&g, _)| g)
            .collect()
    }

    pub fn has_incoming(&self) -> bool {
        self.incoming.values().any(|q| !q.is_empty())
    }

    /// Any queued outgoing message (empty touched batches do not count).
    pub fn has_outgoing(&self) -> bool {
        self.outgoing.values().any(|q| !q.is_empty())
    }

    pub fn append_incoming(&mut self, from: Gid, msgs: impl IntoIterator<Item = Bytes>) {
        self.incoming.entry(from).or_default().extend(msgs);
    }

    pub fn clear_incoming(&mut self) {
        self.incoming.clear();
    }

    /// Drain all outgoing queues, in target order.
    pub fn take_outgoing(&mut self) -> Vec<(BlockId, MessageQueue)> {
        std::mem::take(&mut self.outgoing).into_iter().collect()
    }
}
