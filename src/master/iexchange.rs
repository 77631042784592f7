//! Asynchronous exchange with global termination detection.
//!
//! [`Master::iexchange`] repeatedly runs the callback on blocks that are not
//! yet done or have unread messages, ships whatever they enqueued right away,
//! and polls for arriving frames. It returns on every rank once
//!
//! - every local block has reported done with empty queues, on every rank,
//! - and no frame is in flight anywhere.
//!
//! Global quiescence is detected with a token ring (Dijkstra–Safra). Every
//! process counts remote frames sent minus received and turns black when it
//! receives one. An idle process holding the token adds its count, ORs in its
//! color, whitens itself, and forwards the token to `rank + 1`. Rank 0 starts
//! each wave with a white, zero token; when a wave comes back white, with
//! rank 0 itself white and idle and the total count at zero, rank 0 sends a
//! terminate notice to everybody. A closing barrier keeps frames and tokens
//! of a following call out of this one.
//!
//! Liveness depends on the callback: a block that never reports done, or one
//! that reports done while leaving messages unread, keeps the loop spinning.

use super::{Blocks, Master};
use crate::algs::communicator::{Communicator, Wait, tags};
use crate::algs::wire::{KIND_IEXCHANGE, WireToken, decode_frame, encode_frame};
use crate::block_error::BlockError;
use crate::master::proxy::{FillIncoming, IProxy};
use crate::master::queues::BlockQueues;
use crate::topology::gid::Gid;
use crate::topology::link::LinkTopology;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type Arrivals = Vec<(Gid, Vec<Bytes>)>;

/// Frames pulled off the transport but not yet handed to their block.
struct Inbox<'c, C> {
    comm: &'c C,
    stash: Mutex<HashMap<Gid, Arrivals>>,
    received: AtomicU64,
    black: AtomicBool,
}

impl<'c, C: Communicator> Inbox<'c, C> {
    fn new(comm: &'c C) -> Self {
        Inbox {
            comm,
            stash: Mutex::new(HashMap::new()),
            received: AtomicU64::new(0),
            black: AtomicBool::new(false),
        }
    }

    /// Drain every frame that has already arrived into the stash.
    fn poll(&self) -> Result<bool, BlockError> {
        let mut any = false;
        while let Some((src, buf)) = self.comm.try_recv_any(tags::IEXCHANGE.base()) {
            let (hdr, msgs) = decode_frame(src, &buf)?;
            if hdr.kind() != KIND_IEXCHANGE {
                return Err(BlockError::comm(src, format!("unexpected frame kind {}", hdr.kind())));
            }
            self.stash.lock().entry(hdr.to()).or_default().push((hdr.from(), msgs));
            self.received.fetch_add(1, Ordering::SeqCst);
            self.black.store(true, Ordering::SeqCst);
            any = true;
        }
        Ok(any)
    }

    fn take(&self, gid: Gid) -> Arrivals {
        self.stash.lock().remove(&gid).unwrap_or_default()
    }

    fn stashed(&self) -> Vec<Gid> {
        self.stash.lock().keys().copied().collect()
    }

    fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Current color; whitens.
    fn take_black(&self) -> bool {
        self.black.swap(false, Ordering::SeqCst)
    }
}

impl<C: Communicator> FillIncoming for Inbox<'_, C> {
    fn fill(&self, gid: Gid, queues: &mut BlockQueues) -> Result<bool, BlockError> {
        self.poll()?;
        let arrivals = self.take(gid);
        let any = !arrivals.is_empty();
        for (from, msgs) in arrivals {
            queues.append_incoming(from, msgs);
        }
        Ok(any)
    }
}

/// This process's side of the termination token ring.
struct Termination {
    rank: usize,
    size: usize,
    sent: u64,
    holding: Option<WireToken>,
    wave_started: bool,
    waves: u64,
    terminated: bool,
}

impl Termination {
    fn new(rank: usize, size: usize) -> Self {
        Termination {
            rank,
            size,
            sent: 0,
            holding: None,
            wave_started: false,
            waves: 0,
            terminated: false,
        }
    }

    fn poll<C: Communicator>(&mut self, comm: &C) -> Result<(), BlockError> {
        while let Some((src, buf)) = comm.try_recv_any(tags::IEXCHANGE_CONTROL.base()) {
            let token = WireToken::from_bytes(&buf).map_err(|e| BlockError::comm(src, e))?;
            match token.kind() {
                WireToken::TOKEN => self.holding = Some(token),
                WireToken::TERMINATE => self.terminated = true,
                k => return Err(BlockError::comm(src, format!("unknown control kind {k}"))),
            }
        }
        Ok(())
    }

    fn send<C: Communicator>(&self, comm: &C, peer: usize, token: WireToken) {
        let _ = comm
            .isend(peer, tags::IEXCHANGE_CONTROL.base(), &token.to_bytes())
            .wait();
    }

    fn start_wave<C: Communicator>(&mut self, comm: &C, inbox: &Inbox<'_, C>) {
        inbox.take_black();
        self.wave_started = true;
        self.waves += 1;
        if self.waves % 10_000 == 0 {
            log::warn!(
                "iexchange: {} termination waves without quiescence; are callbacks still producing messages?",
                self.waves
            );
        }
        log::trace!("[rank 0] starting termination wave {}", self.waves);
        self.send(comm, 1 % self.size, WireToken::token(false, 0));
    }

    /// Called only while locally idle. Returns whether rank 0 just declared
    /// global termination.
    fn on_idle<C: Communicator>(&mut self, comm: &C, inbox: &Inbox<'_, C>) -> bool {
        let count = self.sent as i64 - inbox.received() as i64;
        if self.rank != 0 {
            if let Some(token) = self.holding.take() {
                let black = token.black() | inbox.take_black();
                log::trace!(
                    "[rank {}] forwarding token black={black} count={}",
                    self.rank,
                    token.count() + count
                );
                self.send(comm, (self.rank + 1) % self.size, WireToken::token(black, token.count() + count));
            }
            return false;
        }
        match self.holding.take() {
            None if !self.wave_started => self.start_wave(comm, inbox),
            None => {}
            Some(token) => {
                let black = inbox.take_black();
                log::trace!(
                    "[rank 0] wave {} returned black={} count={}",
                    self.waves,
                    token.black() || black,
                    token.count() + count
                );
                if !token.black() && !black && token.count() + count == 0 {
                    let sends: Vec<_> = (1..self.size)
                        .map(|p| {
                            comm.isend(p, tags::IEXCHANGE_CONTROL.base(), &WireToken::terminate().to_bytes())
                        })
                        .collect();
                    for s in sends {
                        let _ = s.wait();
                    }
                    return true;
                }
                self.start_wave(comm, inbox);
            }
        }
        false
    }
}

/// Move every queued batch to its destination; local ones directly, remote
/// ones as frames. Returns how many non-empty batches left their queues; a
/// batch for an unknown local gid is dropped and recorded in `maybe_err`.
fn deliver<B: Send, C: Communicator, L: LinkTopology>(
    comm: &C,
    blocks: &mut Blocks<B, L>,
    sent: &mut u64,
    maybe_err: &mut Option<BlockError>,
) -> usize {
    let me = comm.rank();
    let mut batches = Vec::new();
    for slot in &mut blocks.slots {
        for (to, q) in slot.queues.take_outgoing() {
            if !q.is_empty() {
                batches.push((slot.gid, to, q));
            }
        }
    }
    let moved = batches.len();
    let mut sends = Vec::new();
    for (from, to, q) in batches {
        if to.proc == me {
            match blocks.lid(to.gid) {
                Some(lid) => blocks.slots[lid].queues.append_incoming(from, q),
                None => {
                    maybe_err.get_or_insert(BlockError::UnknownBlock(to.gid));
                }
            }
        } else {
            let frame = encode_frame(KIND_IEXCHANGE, from, to.gid, 0, q.iter());
            sends.push(comm.isend(to.proc, tags::IEXCHANGE.base(), &frame));
            *sent += 1;
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    moved
}

impl<B: Send, C: Communicator, L: LinkTopology> Master<B, C, L> {
    /// Run `f` until every block on every rank is done and no message is left
    /// anywhere.
    ///
    /// `f` returns `true` once its block has nothing more to do; it is called
    /// again whenever new messages arrive for the block. Inside the callback,
    /// [`IProxy::fill_incoming`] pulls in messages that arrived meanwhile.
    /// Collective: all ranks must call it.
    pub fn iexchange<F>(&mut self, f: F) -> Result<(), BlockError>
    where
        F: Fn(&mut B, &mut IProxy<'_, L>) -> Result<bool, BlockError> + Sync,
    {
        let (me, size) = (self.comm.rank(), self.comm.size());
        let inbox = Inbox::new(&self.comm);
        let mut term = Termination::new(me, size);
        let mut done = vec![false; self.blocks.len()];
        let mut passes = 0u64;
        // Bad targets are reported once every rank has terminated.
        let mut maybe_err = None;

        loop {
            inbox.poll()?;
            term.poll(&self.comm)?;
            if term.terminated {
                break;
            }
            for gid in inbox.stashed() {
                let batches = inbox.take(gid);
                let Some(lid) = self.blocks.lid(gid) else {
                    maybe_err.get_or_insert(BlockError::UnknownBlock(gid));
                    continue;
                };
                for (from, msgs) in batches {
                    self.blocks.slots[lid].queues.append_incoming(from, msgs);
                }
            }

            let select: Vec<bool> = self
                .blocks
                .slots
                .iter()
                .zip(&done)
                .map(|(s, &d)| !d || s.queues.has_incoming())
                .collect();
            let active = select.iter().any(|&s| s);
            if active {
                let inbox_ref: &dyn FillIncoming = &inbox;
                let results = self.blocks.visit(&select, |block, view| {
                    let mut proxy = IProxy::new(view.into_proxy(), inbox_ref);
                    f(block, &mut proxy)
                })?;
                for (i, d) in results {
                    done[i] = d;
                }
                passes += 1;
            }

            let moved = deliver(&self.comm, &mut self.blocks, &mut term.sent, &mut maybe_err);
            if active || moved > 0 {
                continue;
            }
            if size == 1 || term.on_idle(&self.comm, &inbox) {
                break;
            }
            std::thread::yield_now();
        }
        // Rank 0 may leave before the others have read TERMINATE; nobody may
        // start the next exchange until everyone has.
        if size > 1 {
            self.comm.barrier()?;
        }

        log::info!(
            "[rank {me}] iexchange finished after {passes} passes, {} frames sent, {} received",
            term.sent,
            inbox.received()
        );
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
