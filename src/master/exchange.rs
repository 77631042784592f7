//! Synchronous, collective queue exchange.
//!
//! Every rank calls [`Master::exchange`] the same number of times. One round:
//!
//! 1. incoming queues are cleared, link targets are touched so every link
//!    edge carries a (possibly empty) batch, and all outgoing queues drain;
//! 2. ranks allgather how many batches each sends to each other rank, plus
//!    how many collectives their blocks posted;
//! 3. batches for local blocks move directly; remote batches go out as
//!    frames on [`tags::EXCHANGE`](crate::algs::communicator::tags::EXCHANGE);
//! 4. each rank receives exactly the counted number of frames per source;
//! 5. pending collectives are resolved.
//!
//! Batches between the same `(from, to)` pair arrive in send order, so a
//! block reads its messages from one source FIFO.

use super::{Master, collectives};
use crate::algs::communicator::{Communicator, Wait, tags};
use crate::algs::wire::{KIND_EXCHANGE, decode_frame, encode_frame};
use crate::block_error::BlockError;
use crate::master::queues::MessageQueue;
use crate::topology::gid::{BlockId, Gid};
use crate::topology::link::LinkTopology;

fn encode_counts(counts: &[u64]) -> Vec<u8> {
    counts.iter().flat_map(|c| c.to_le_bytes()).collect()
}

fn decode_counts(peer: usize, buf: &[u8], len: usize) -> Result<Vec<u64>, BlockError> {
    if buf.len() != len * 8 {
        return Err(BlockError::comm(
            peer,
            format!("exchange counts: expected {} bytes, got {}", len * 8, buf.len()),
        ));
    }
    Ok(buf
        .chunks_exact(8)
        .map(|c| {
            let mut le = [0u8; 8];
            le.copy_from_slice(c);
            u64::from_le_bytes(le)
        })
        .collect())
}

impl<B: Send, C: Communicator, L: LinkTopology> Master<B, C, L> {
    /// Deliver every queued message to its destination block.
    ///
    /// Collective: all ranks must call it. Incoming queues hold exactly this
    /// round's messages afterwards.
    pub fn exchange(&mut self) -> Result<(), BlockError> {
        self.exchange_queues(true)
    }

    /// One exchange round. `touch_links` is off for reductions, which only
    /// talk to the partners of the current round.
    pub(crate) fn exchange_queues(&mut self, touch_links: bool) -> Result<(), BlockError> {
        self.round += 1;
        let round = self.round;
        let (me, size) = (self.comm.rank(), self.comm.size());

        let mut batches: Vec<(Gid, BlockId, MessageQueue)> = Vec::new();
        for slot in &mut self.blocks.slots {
            slot.queues.clear_incoming();
            if touch_links {
                for target in slot.link.unique_targets() {
                    slot.queues.touch_outgoing(target);
                }
            }
            for (to, q) in slot.queues.take_outgoing() {
                batches.push((slot.gid, to, q));
            }
        }

        let ncoll = self
            .blocks
            .slots
            .iter()
            .map(|s| s.collectives.pending_len())
            .max()
            .unwrap_or(0);
        // Held until the collective part below is done; peers block on every
        // frame and collective announced here.
        let mut maybe_err = None;
        let mut counts = vec![0u64; size + 1];
        batches.retain(|(from, to, _)| {
            if to.proc >= size {
                maybe_err.get_or_insert(BlockError::AssignmentMismatch(format!(
                    "block {from} addresses {to} but only {size} ranks exist"
                )));
                return false;
            }
            if to.proc != me {
                counts[to.proc] += 1;
            }
            true
        });
        counts[size] = ncoll as u64;
        let all = self.comm.allgather(&encode_counts(&counts))?;
        let mut expected = vec![0u64; size];
        let mut ncoll_global = 0u64;
        for (peer, buf) in all.iter().enumerate() {
            let theirs = decode_counts(peer, buf, size + 1)?;
            if peer != me {
                expected[peer] = theirs[me];
            }
            ncoll_global = ncoll_global.max(theirs[size]);
        }

        let mut sends = Vec::new();
        let mut local = 0usize;
        for (from, to, q) in batches {
            if to.proc == me {
                match self.blocks.lid(to.gid) {
                    Some(lid) => {
                        self.blocks.slots[lid].queues.append_incoming(from, q);
                        local += 1;
                    }
                    None => {
                        maybe_err.get_or_insert(BlockError::UnknownBlock(to.gid));
                    }
                }
            } else {
                let frame = encode_frame(KIND_EXCHANGE, from, to.gid, round, q.iter());
                sends.push(self.comm.isend(to.proc, tags::EXCHANGE.base(), &frame));
            }
        }
        let remote_out = sends.len();

        let mut remote_in = 0usize;
        for src in (0..size).filter(|&s| s != me) {
            for _ in 0..expected[src] {
                let res = match self.comm.irecv(src, tags::EXCHANGE.base()).wait() {
                    Some(buf) => self.deliver_frame(src, &buf, round),
                    None => Err(BlockError::comm(src, "exchange frame missing")),
                };
                match res {
                    Ok(()) => remote_in += 1,
                    Err(e) => {
                        maybe_err.get_or_insert(e);
                    }
                }
            }
        }
        for s in sends {
            let _ = s.wait();
        }

        if ncoll_global > 0 {
            collectives::resolve(
                &self.comm,
                ncoll_global as usize,
                self.blocks.slots.iter_mut().map(|s| &mut s.collectives),
            )?;
        } else {
            for slot in &mut self.blocks.slots {
                slot.collectives.clear_results();
            }
        }
        if let Some(e) = maybe_err {
            return Err(e);
        }
        log::debug!(
            "[rank {me}] exchange round {round}: {local} local, {remote_out} sent, {remote_in} received"
        );
        Ok(())
    }

    fn deliver_frame(&mut self, src: usize, buf: &[u8], round: u64) -> Result<(), BlockError> {
        let (hdr, msgs) = decode_frame(src, buf)?;
        if hdr.kind() != KIND_EXCHANGE {
            return Err(BlockError::comm(src, format!("unexpected frame kind {}", hdr.kind())));
        }
        if hdr.round() != round {
            return Err(BlockError::comm(
                src,
                format!("frame from exchange round {} arrived in round {round}", hdr.round()),
            ));
        }
        let lid = self
            .blocks
            .lid(hdr.to())
            .ok_or(BlockError::UnknownBlock(hdr.to()))?;
        self.blocks.slots[lid].queues.append_incoming(hdr.from(), msgs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::algs::communicator::NoComm;
    use crate::block_error::BlockError;
    use crate::master::Master;
    use crate::master::collectives::{CollectiveValue, ReduceOp};
    use crate::topology::gid::{BlockId, Gid};
    use crate::topology::link::{Link, LinkTopology};

    #[test]
    fn local_ring_delivers_in_order() {
        let mut m: Master<u32, NoComm> = Master::new(NoComm);
        for g in 0..3 {
            let next = BlockId::new(Gid::new((g + 1) % 3), 0);
            m.add(Gid::new(g), 0, [next].into_iter().collect()).unwrap();
        }
        m.foreach(|_, p| {
            let to = p.link().target(0).ok_or(BlockError::Callback("no target".into()))?;
            p.enqueue(to, &(p.gid().get() as u32))?;
            p.enqueue(to, &100u32)?;
            Ok(())
        })
        .unwrap();
        m.exchange().unwrap();
        m.foreach(|b, p| {
            let prev = Gid::new((p.gid().get() + 2) % 3);
            *b = p.dequeue::<u32>(prev)?;
            assert_eq!(p.dequeue::<u32>(prev)?, 100);
            assert!(!p.incoming(prev));
            Ok(())
        })
        .unwrap();
        for i in 0..3 {
            assert_eq!(m.resident_block(i), Some(&(((i + 2) % 3) as u32)));
        }
    }

    #[test]
    fn unknown_target_fails() {
        let mut m: Master<u32, NoComm> = Master::new(NoComm);
        m.add(Gid::new(0), 0, Link::new()).unwrap();
        m.foreach(|_, p| p.enqueue(BlockId::new(Gid::new(7), 0), &1u8))
            .unwrap();
        let err = m.exchange().unwrap_err();
        assert!(matches!(err, BlockError::UnknownBlock(g) if g == Gid::new(7)));
    }

    #[test]
    fn collectives_resolve_after_exchange() {
        let mut m: Master<u64, NoComm> = Master::new(NoComm);
        for g in 0..4 {
            m.add(Gid::new(g), g as u64, Link::new()).unwrap();
        }
        m.foreach(|b, p| {
            p.all_reduce(*b, ReduceOp::Sum);
            p.all_reduce(*b, ReduceOp::Max);
            Ok(())
        })
        .unwrap();
        m.exchange().unwrap();
        m.foreach(|_, p| {
            assert_eq!(p.collective(0), Some(CollectiveValue::U64(6)));
            assert_eq!(p.collective(1), Some(CollectiveValue::U64(3)));
            Ok(())
        })
        .unwrap();
        m.exchange().unwrap();
        m.foreach(|_, p| {
            assert_eq!(p.collective(0), None);
            Ok(())
        })
        .unwrap();
    }
}
