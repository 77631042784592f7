//! Thin façade over intra-process (Rayon) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* of any length (no zero-copy
//! guarantees). Every backend must deliver messages between a fixed
//! `(src, dst, tag)` triple in send order; the exchange protocols and the
//! default collectives below rely on it.
//!
//! All send handles are **waitable** but non-blocking; callers `.wait()` on
//! them before trusting that a buffer has left. Receive handles block in
//! `.wait()` until a matching message arrived.
//!
//! Backends are created and torn down explicitly: [`RayonComm::universe`]
//! hands out one communicator per rank over a private mailbox that disappears
//! with the last handle, and [`MpiComm`] owns the MPI universe, finalizing it
//! on drop. Nothing is kept in process-wide statics, so tests can set up and
//! tear down as many universes as they like.

use crate::block_error::BlockError;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Typed message tag. Protocols reserve disjoint tag ranges.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn base(self) -> u16 {
        self.0
    }

    /// Tag `k` steps above this one, for protocols needing several channels.
    #[inline]
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Tags reserved by the runtime.
pub mod tags {
    use super::CommTag;

    /// Queue batches of the synchronous exchange.
    pub const EXCHANGE: CommTag = CommTag(0x4200);
    /// Queue frames of the asynchronous exchange.
    pub const IEXCHANGE: CommTag = CommTag(0x4300);
    /// Termination token and terminate notices of the asynchronous exchange.
    pub const IEXCHANGE_CONTROL: CommTag = CommTag(0x4301);
    /// Default point-to-point collectives.
    pub const COLLECTIVE: CommTag = CommTag(0x7F00);
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Point-to-point plus collective messaging between `size()` ranks.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + Send;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Receive the next message from `peer` on `tag`, whatever its length.
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;

    /// Pop one message on `tag` from any rank if one has already arrived.
    fn try_recv_any(&self, tag: u16) -> Option<(usize, Vec<u8>)>;

    /// `true` if this comm never talks to another rank.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Every rank's `data`, indexed by rank.
    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, BlockError> {
        let (me, size) = (self.rank(), self.size());
        let tag = tags::COLLECTIVE.base();
        let sends: Vec<_> = (0..size)
            .filter(|&p| p != me)
            .map(|p| self.isend(p, tag, data))
            .collect();
        let mut out = Vec::with_capacity(size);
        let mut maybe_err = None;
        for peer in 0..size {
            if peer == me {
                out.push(data.to_vec());
                continue;
            }
            match self.irecv(peer, tag).wait() {
                Some(buf) => out.push(buf),
                None => {
                    out.push(Vec::new());
                    maybe_err.get_or_insert_with(|| {
                        BlockError::comm(peer, "allgather contribution missing")
                    });
                }
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    fn barrier(&self) -> Result<(), BlockError> {
        self.allgather(&[]).map(|_| ())
    }

    /// Element-wise sum of `vals` over all ranks, in place.
    fn allreduce_sum(&self, vals: &mut [u64]) -> Result<(), BlockError> {
        let mine: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let all = self.allgather(&mine)?;
        vals.iter_mut().for_each(|v| *v = 0);
        for (peer, buf) in all.iter().enumerate() {
            if buf.len() != mine.len() {
                return Err(BlockError::comm(
                    peer,
                    format!("allreduce expected {} bytes, got {}", mine.len(), buf.len()),
                ));
            }
            for (v, chunk) in vals.iter_mut().zip(buf.chunks_exact(8)) {
                let mut le = [0u8; 8];
                le.copy_from_slice(chunk);
                *v += u64::from_le_bytes(le);
            }
        }
        Ok(())
    }

    /// Replace `data` on every rank with the root's copy.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), BlockError> {
        let tag = tags::COLLECTIVE.base();
        if self.rank() == root {
            let sends: Vec<_> = (0..self.size())
                .filter(|&p| p != root)
                .map(|p| self.isend(p, tag, data))
                .collect();
            for s in sends {
                let _ = s.wait();
            }
            Ok(())
        } else {
            *data = self
                .irecv(root, tag)
                .wait()
                .ok_or_else(|| BlockError::comm(root, "broadcast payload missing"))?;
            Ok(())
        }
    }
}

/// Compile-time no-op comm for pure serial runs: one rank, no traffic.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}
    fn try_recv_any(&self, _tag: u16) -> Option<(usize, Vec<u8>)> {
        None
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)
type Mailbox = DashMap<Key, VecDeque<Bytes>>;

/// Ranks simulated as threads of one process.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// One communicator per rank, all sharing a fresh mailbox.
    pub fn universe(size: usize) -> Vec<RayonComm> {
        let mailbox = Arc::new(Mailbox::new());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    /// Messages sent but not yet received, across the whole universe.
    pub fn in_flight(&self) -> usize {
        self.mailbox.iter().map(|e| e.value().len()).sum()
    }

    fn pop(&self, key: &Key) -> Option<Bytes> {
        self.mailbox.get_mut(key).and_then(|mut q| q.pop_front())
    }
}

/// Receive half of a [`RayonComm`] message.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some(bytes) = self.mailbox.get_mut(&self.key).and_then(|mut q| q.pop_front()) {
                return Some(bytes.to_vec());
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn try_recv_any(&self, tag: u16) -> Option<(usize, Vec<u8>)> {
        (0..self.size).find_map(|src| {
            self.pop(&(src, self.rank, tag))
                .map(|bytes| (src, bytes.to_vec()))
        })
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use mpi::Threading;

    struct MpiInner {
        // Declared before `_universe` so the communicator is released first.
        world: SimpleCommunicator,
        _universe: Universe,
    }

    // SAFETY: MPI is initialized with `Threading::Multiple`, which permits
    // concurrent calls from any thread.
    unsafe impl Send for MpiInner {}
    unsafe impl Sync for MpiInner {}

    /// MPI world communicator. Dropping the last clone finalizes MPI.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiInner>,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, BlockError> {
            let (universe, level) = mpi::initialize_with_threading(Threading::Multiple)
                .ok_or_else(|| BlockError::Configuration("MPI is already initialized".into()))?;
            if level != Threading::Multiple {
                return Err(BlockError::Configuration(format!(
                    "MPI provides {level:?} threading, need Multiple"
                )));
            }
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                inner: Arc::new(MpiInner {
                    world,
                    _universe: universe,
                }),
                rank,
                size,
            })
        }
    }

    /// Pending MPI send; owns the buffer until completion.
    pub struct MpiSendHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    // SAFETY: the buffer is owned exclusively by the handle.
    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            // SAFETY: `buf` came from `Box::into_raw` and the request is done.
            unsafe { drop(Box::from_raw(self.buf)) };
        }
    }

    /// Deferred blocking receive.
    pub struct MpiRecvHandle {
        inner: Arc<MpiInner>,
        peer: usize,
        tag: u16,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .inner
                .world
                .process_at_rank(self.peer as i32)
                .receive_vec_with_tag::<u8>(i32::from(self.tag));
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation lives until `MpiSendHandle` drops, which
            // waits for the request first.
            let data: &'static [u8] = unsafe { &*raw };
            let req = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, i32::from(tag));
            MpiSendHandle {
                req: Some(req),
                buf: raw,
            }
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecvHandle {
            MpiRecvHandle {
                inner: Arc::clone(&self.inner),
                peer,
                tag,
            }
        }

        fn try_recv_any(&self, tag: u16) -> Option<(usize, Vec<u8>)> {
            let (msg, status) = self
                .inner
                .world
                .any_process()
                .immediate_matched_probe_with_tag(i32::from(tag))?;
            let src = status.source_rank() as usize;
            let (data, _) = msg.matched_receive_vec::<u8>();
            Some((src, data))
        }

        fn barrier(&self) -> Result<(), BlockError> {
            self.inner.world.barrier();
            Ok(())
        }

        fn allreduce_sum(&self, vals: &mut [u64]) -> Result<(), BlockError> {
            let mine = vals.to_vec();
            self.inner
                .world
                .all_reduce_into(&mine[..], vals, SystemOperation::sum());
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_roundtrip_two_ranks() {
        let comms = RayonComm::universe(2);
        let recv = comms[1].irecv(0, 7);
        comms[0].isend(1, 7, &[1, 2, 3, 4]).wait();
        let data = recv.wait().expect("Expected to receive data from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert_eq!(comms[0].in_flight(), 0);
    }

    #[test]
    fn universes_do_not_share_mailboxes() {
        let a = RayonComm::universe(2);
        let b = RayonComm::universe(2);
        a[0].isend(1, 3, b"a");
        assert!(b[1].try_recv_any(3).is_none());
        assert_eq!(a[1].try_recv_any(3), Some((0, b"a".to_vec())));
    }

    #[test]
    fn try_recv_any_respects_tags() {
        let comms = RayonComm::universe(3);
        comms[2].isend(0, 11, b"x");
        assert!(comms[0].try_recv_any(10).is_none());
        assert_eq!(comms[0].try_recv_any(11), Some((2, b"x".to_vec())));
        assert!(comms[0].try_recv_any(11).is_none());
    }

    #[test]
    fn no_comm_collectives_are_local() {
        let c = NoComm;
        let mut v = [3u64, 4];
        c.allreduce_sum(&mut v).unwrap();
        assert_eq!(v, [3, 4]);
        assert_eq!(c.allgather(b"me").unwrap(), vec![b"me".to_vec()]);
        c.barrier().unwrap();
    }

    #[test]
    fn rayon_collectives_across_threads() {
        let handles: Vec<_> = RayonComm::universe(4)
            .into_iter()
            .map(|c| {
                std::thread::spawn(move || {
                    let mut v = [c.rank() as u64, 1];
                    c.allreduce_sum(&mut v).unwrap();
                    let mut payload = if c.rank() == 2 { b"root".to_vec() } else { Vec::new() };
                    c.broadcast(2, &mut payload).unwrap();
                    c.barrier().unwrap();
                    (v, payload)
                })
            })
            .collect();
        for h in handles {
            let (v, payload) = h.join().unwrap();
            assert_eq!(v, [6, 4]);
            assert_eq!(payload, b"root".to_vec());
        }
    }
}
