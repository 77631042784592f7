//! The block container.
//!
//! A [`Master`] owns every block resident on this process together with its
//! link and message queues, and drives user callbacks over them:
//!
//! - [`Master::foreach`] runs a callback on every block (optionally on a
//!   rayon pool; different blocks run concurrently, one block never does),
//! - [`Master::exchange`] delivers queued messages collectively,
//! - [`Master::iexchange`] alternates callbacks and delivery until global
//!   quiescence.
//!
//! With an [`ExternalStorage`] attached, blocks can live outside memory. Each
//! block is in one of three states: absent (never added or released),
//! resident, or externalized. Callbacks always see resident blocks: they are
//! loaded just before the call and the eviction policy is applied after each
//! batch of calls. Externalizing always persists the payload first. Queues
//! and links stay in memory regardless of residency.

pub mod collectives;
mod exchange;
mod iexchange;
pub mod proxy;
pub mod queues;

use crate::algs::communicator::Communicator;
use crate::block_error::BlockError;
use crate::debug_invariants::DebugInvariants;
use crate::master::collectives::BlockCollectives;
use crate::master::proxy::Proxy;
use crate::master::queues::BlockQueues;
use crate::storage::{
    BlockCodec, EvictionPolicy, ExternalStorage, LeastRecentlyUsed, NeverEvict, ResidentBlock,
    StorageKey,
};
use crate::topology::gid::Gid;
use crate::topology::link::{Link, LinkTopology};
use rayon::prelude::*;
use std::collections::HashMap;

/// Execution knobs of a [`Master`].
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Worker threads for callbacks; `1` runs inline, `0` uses rayon's default.
    pub threads: usize,
    /// Maximum number of resident blocks once storage is attached.
    pub limit: Option<usize>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            threads: 1,
            limit: None,
        }
    }
}

/// Predicate deciding which blocks a `foreach` leaves out.
pub trait Skip: Sync {
    fn skip(&self, gid: Gid, queues: &BlockQueues) -> bool;
}

/// Visit every block.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSkip;

impl Skip for NeverSkip {
    fn skip(&self, _gid: Gid, _queues: &BlockQueues) -> bool {
        false
    }
}

/// Visit only blocks with unread messages.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipNoIncoming;

impl Skip for SkipNoIncoming {
    fn skip(&self, _gid: Gid, queues: &BlockQueues) -> bool {
        !queues.has_incoming()
    }
}

/// Borrowed pieces of one slot handed to a callback runner.
pub(crate) struct SlotView<'a, L> {
    pub gid: Gid,
    pub link: &'a L,
    pub queues: &'a mut BlockQueues,
    pub collectives: &'a mut BlockCollectives,
}

impl<'a, L> SlotView<'a, L> {
    pub fn into_proxy(self) -> Proxy<'a, L> {
        Proxy::new(self.gid, self.link, self.queues, self.collectives)
    }
}

enum Residency<B> {
    Resident(B),
    External(StorageKey),
}

struct BlockSlot<B, L> {
    gid: Gid,
    link: L,
    residency: Residency<B>,
    queues: BlockQueues,
    collectives: BlockCollectives,
    last_used: u64,
}

impl<B, L> BlockSlot<B, L> {
    fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident(_))
    }

    fn visit<R, F>(&mut self, f: &F) -> Result<R, BlockError>
    where
        F: Fn(&mut B, SlotView<'_, L>) -> Result<R, BlockError>,
    {
        let view = SlotView {
            gid: self.gid,
            link: &self.link,
            queues: &mut self.queues,
            collectives: &mut self.collectives,
        };
        match &mut self.residency {
            Residency::Resident(block) => f(block, view),
            Residency::External(_) => Err(BlockError::NotResident(self.gid)),
        }
    }
}

/// Block slots plus everything needed to run callbacks over them. Kept apart
/// from the communicator so protocols can borrow both at once.
pub(crate) struct Blocks<B, L> {
    slots: Vec<BlockSlot<B, L>>,
    lids: HashMap<Gid, usize>,
    pool: Option<rayon::ThreadPool>,
    storage: Option<Box<dyn ExternalStorage>>,
    codec: Option<BlockCodec<B>>,
    policy: Box<dyn EvictionPolicy>,
    clock: u64,
}

impl<B: Send, L: LinkTopology> Blocks<B, L> {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn lid(&self, gid: Gid) -> Option<usize> {
        self.lids.get(&gid).copied()
    }

    fn check(&self, i: usize) -> Result<(), BlockError> {
        if i < self.slots.len() {
            Ok(())
        } else {
            Err(BlockError::Configuration(format!(
                "no block at local index {i} (master holds {})",
                self.slots.len()
            )))
        }
    }

    fn load(&mut self, i: usize) -> Result<(), BlockError> {
        self.check(i)?;
        self.clock += 1;
        let slot = &mut self.slots[i];
        slot.last_used = self.clock;
        if let Residency::External(key) = slot.residency {
            let (Some(storage), Some(codec)) = (&self.storage, &self.codec) else {
                return Err(BlockError::NotResident(slot.gid));
            };
            let bytes = storage.get(key)?;
            let block = codec.load(&bytes)?;
            slot.residency = Residency::Resident(block);
            storage.destroy(key)?;
            log::debug!("loaded block {} ({} bytes)", slot.gid, bytes.len());
        }
        Ok(())
    }

    fn unload(&mut self, i: usize) -> Result<(), BlockError> {
        self.check(i)?;
        let (Some(storage), Some(codec)) = (&self.storage, &self.codec) else {
            return Err(BlockError::Configuration(
                "cannot unload a block without attached storage".into(),
            ));
        };
        let slot = &mut self.slots[i];
        if let Residency::Resident(block) = &slot.residency {
            let bytes = codec.save(block)?;
            let key = storage.put(&bytes)?;
            slot.residency = Residency::External(key);
            log::debug!("externalized block {} ({} bytes)", slot.gid, bytes.len());
        }
        Ok(())
    }

    fn enforce_policy(&mut self) -> Result<(), BlockError> {
        if self.storage.is_none() {
            return Ok(());
        }
        let resident: Vec<ResidentBlock> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_resident())
            .map(|(index, s)| ResidentBlock {
                index,
                gid: s.gid,
                last_used: s.last_used,
            })
            .collect();
        for i in self.policy.victims(&resident) {
            self.unload(i)?;
        }
        Ok(())
    }

    /// Run `f` on every selected block, loading before and evicting after.
    ///
    /// With a resident limit, blocks are processed in batches of at most that
    /// many so the limit holds between batches.
    pub(crate) fn visit<R, F>(&mut self, select: &[bool], f: F) -> Result<Vec<(usize, R)>, BlockError>
    where
        R: Send,
        F: Fn(&mut B, SlotView<'_, L>) -> Result<R, BlockError> + Sync,
    {
        let chosen: Vec<usize> = (0..self.slots.len())
            .filter(|&i| select.get(i).copied().unwrap_or(false))
            .collect();
        if chosen.is_empty() {
            return Ok(Vec::new());
        }
        let batch = match (&self.storage, self.policy.limit()) {
            (Some(_), Some(limit)) => limit.max(1),
            _ => chosen.len(),
        };
        let mut out = Vec::with_capacity(chosen.len());
        for chunk in chosen.chunks(batch) {
            for &i in chunk {
                self.load(i)?;
            }
            let mut mask = vec![false; self.slots.len()];
            for &i in chunk {
                mask[i] = true;
            }
            let slots = &mut self.slots;
            let results: Vec<(usize, R)> = match &self.pool {
                Some(pool) => pool.install(|| {
                    slots
                        .par_iter_mut()
                        .enumerate()
                        .filter(|(i, _)| mask[*i])
                        .map(|(i, slot)| slot.visit(&f).map(|r| (i, r)))
                        .collect::<Result<Vec<_>, BlockError>>()
                })?,
                None => slots
                    .iter_mut()
                    .enumerate()
                    .filter(|(i, _)| mask[*i])
                    .map(|(i, slot)| slot.visit(&f).map(|r| (i, r)))
                    .collect::<Result<Vec<_>, BlockError>>()?,
            };
            out.extend(results);
            self.enforce_policy()?;
        }
        Ok(out)
    }
}

/// Owner of the blocks resident on one process.
///
/// Monomorphic over the block type `B`, the communicator `C` and the link
/// flavor `L`.
pub struct Master<B, C: Communicator, L: LinkTopology = Link> {
    comm: C,
    blocks: Blocks<B, L>,
    threads: usize,
    round: u64,
}

impl<B: Send, C: Communicator, L: LinkTopology> Master<B, C, L> {
    /// Single-threaded master without storage.
    pub fn new(comm: C) -> Self {
        Master {
            comm,
            blocks: Blocks {
                slots: Vec::new(),
                lids: HashMap::new(),
                pool: None,
                storage: None,
                codec: None,
                policy: Box::new(NeverEvict),
                clock: 0,
            },
            threads: 1,
            round: 0,
        }
    }

    pub fn with_config(comm: C, config: MasterConfig) -> Result<Self, BlockError> {
        let mut master = Self::new(comm);
        if config.threads != 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .build()
                .map_err(|e| BlockError::Configuration(format!("thread pool: {e}")))?;
            master.threads = pool.current_num_threads();
            master.blocks.pool = Some(pool);
        }
        if let Some(limit) = config.limit {
            master.blocks.policy = Box::new(LeastRecentlyUsed::new(limit));
        }
        Ok(master)
    }

    /// Attach out-of-core storage and the hooks that (de)serialize blocks.
    pub fn with_storage<S: ExternalStorage + 'static>(mut self, storage: S, codec: BlockCodec<B>) -> Self {
        self.blocks.storage = Some(Box::new(storage));
        self.blocks.codec = Some(codec);
        self
    }

    /// Replace the eviction policy chosen from [`MasterConfig::limit`].
    pub fn with_eviction_policy<P: EvictionPolicy + 'static>(mut self, policy: P) -> Self {
        self.blocks.policy = Box::new(policy);
        self
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of blocks registered here, resident or not.
    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn gid(&self, i: usize) -> Option<Gid> {
        self.blocks.slots.get(i).map(|s| s.gid)
    }

    /// All local gids in slot order.
    pub fn gids(&self) -> Vec<Gid> {
        self.blocks.slots.iter().map(|s| s.gid).collect()
    }

    /// Local index of `gid`.
    pub fn lid(&self, gid: Gid) -> Option<usize> {
        self.blocks.lid(gid)
    }

    pub fn local(&self, gid: Gid) -> bool {
        self.blocks.lids.contains_key(&gid)
    }

    pub fn link(&self, i: usize) -> Option<&L> {
        self.blocks.slots.get(i).map(|s| &s.link)
    }

    pub fn is_resident(&self, i: usize) -> bool {
        self.blocks.slots.get(i).is_some_and(BlockSlot::is_resident)
    }

    /// Number of blocks currently in memory.
    pub fn in_memory(&self) -> usize {
        self.blocks.slots.iter().filter(|s| s.is_resident()).count()
    }

    pub fn has_incoming(&self, i: usize) -> bool {
        self.blocks
            .slots
            .get(i)
            .is_some_and(|s| s.queues.has_incoming())
    }

    /// Register a new resident block and return its local index.
    pub fn add(&mut self, gid: Gid, block: B, link: L) -> Result<usize, BlockError> {
        if self.blocks.lids.contains_key(&gid) {
            return Err(BlockError::DuplicateGid(gid));
        }
        self.blocks.clock += 1;
        let i = self.blocks.slots.len();
        self.blocks.slots.push(BlockSlot {
            gid,
            link,
            residency: Residency::Resident(block),
            queues: BlockQueues::default(),
            collectives: BlockCollectives::default(),
            last_used: self.blocks.clock,
        });
        self.blocks.lids.insert(gid, i);
        crate::debug_invariants!(self.validate_invariants(), "Master::add");
        self.blocks.enforce_policy()?;
        Ok(i)
    }

    /// Remove block `i` from the master, handing back its payload and link.
    /// Later blocks shift down by one index.
    pub fn release(&mut self, i: usize) -> Result<(Gid, B, L), BlockError> {
        self.blocks.load(i)?;
        let slot = self.blocks.slots.remove(i);
        self.blocks.lids.remove(&slot.gid);
        for (j, s) in self.blocks.slots.iter().enumerate().skip(i) {
            self.blocks.lids.insert(s.gid, j);
        }
        match slot.residency {
            Residency::Resident(block) => Ok((slot.gid, block, slot.link)),
            Residency::External(_) => Err(BlockError::NotResident(slot.gid)),
        }
    }

    /// Block `i`, loading it from storage if needed.
    pub fn block(&mut self, i: usize) -> Result<&mut B, BlockError> {
        self.blocks.load(i)?;
        let slot = &mut self.blocks.slots[i];
        match &mut slot.residency {
            Residency::Resident(block) => Ok(block),
            Residency::External(_) => Err(BlockError::NotResident(slot.gid)),
        }
    }

    /// Block `i` if it is in memory.
    pub fn resident_block(&self, i: usize) -> Option<&B> {
        match &self.blocks.slots.get(i)?.residency {
            Residency::Resident(block) => Some(block),
            Residency::External(_) => None,
        }
    }

    /// Bring block `i` into memory.
    pub fn load(&mut self, i: usize) -> Result<(), BlockError> {
        self.blocks.load(i)
    }

    /// Persist block `i` to storage and drop it from memory.
    pub fn unload(&mut self, i: usize) -> Result<(), BlockError> {
        self.blocks.unload(i)
    }

    /// Apply `f` to block `i` without letting it escape; the eviction policy
    /// runs afterwards.
    pub(crate) fn with_block<R>(
        &mut self,
        i: usize,
        f: impl FnOnce(&B, &L) -> Result<R, BlockError>,
    ) -> Result<R, BlockError> {
        self.blocks.load(i)?;
        let slot = &self.blocks.slots[i];
        let out = match &slot.residency {
            Residency::Resident(block) => f(block, &slot.link),
            Residency::External(_) => Err(BlockError::NotResident(slot.gid)),
        };
        self.blocks.enforce_policy()?;
        out
    }

    pub(crate) fn visit<R, F>(&mut self, select: &[bool], f: F) -> Result<Vec<(usize, R)>, BlockError>
    where
        R: Send,
        F: Fn(&mut B, SlotView<'_, L>) -> Result<R, BlockError> + Sync,
    {
        self.blocks.visit(select, f)
    }

    /// Run `f(block, proxy)` on every block.
    pub fn foreach<F>(&mut self, f: F) -> Result<(), BlockError>
    where
        F: Fn(&mut B, &mut Proxy<'_, L>) -> Result<(), BlockError> + Sync,
    {
        self.foreach_skip(f, &NeverSkip)
    }

    /// Run `f(block, proxy)` on every block `skip` does not exclude.
    pub fn foreach_skip<F, S>(&mut self, f: F, skip: &S) -> Result<(), BlockError>
    where
        F: Fn(&mut B, &mut Proxy<'_, L>) -> Result<(), BlockError> + Sync,
        S: Skip + ?Sized,
    {
        let select: Vec<bool> = self
            .blocks
            .slots
            .iter()
            .map(|s| !skip.skip(s.gid, &s.queues))
            .collect();
        log::debug!(
            "[rank {}] foreach over {} of {} blocks",
            self.comm.rank(),
            select.iter().filter(|&&s| s).count(),
            select.len()
        );
        self.blocks.visit(&select, |block, view| {
            let mut proxy = view.into_proxy();
            f(block, &mut proxy)
        })?;
        Ok(())
    }
}

impl<B, C: Communicator, L: LinkTopology> DebugInvariants for Master<B, C, L> {
    const WHAT: &'static str = "Master";

    fn validate_invariants(&self) -> Result<(), BlockError> {
        if self.blocks.lids.len() != self.blocks.slots.len() {
            return Err(BlockError::Configuration(format!(
                "{} gids indexed for {} slots",
                self.blocks.lids.len(),
                self.blocks.slots.len()
            )));
        }
        for (i, s) in self.blocks.slots.iter().enumerate() {
            if self.blocks.lids.get(&s.gid) != Some(&i) {
                return Err(BlockError::Configuration(format!(
                    "gid {} in slot {i} is indexed elsewhere",
                    s.gid
                )));
            }
            if !s.is_resident() && self.blocks.storage.is_none() {
                return Err(BlockError::NotResident(s.gid));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::storage::MemoryStorage;
    use crate::topology::gid::BlockId;

    fn ring(n: usize) -> Master<u64, NoComm> {
        let mut m = Master::new(NoComm);
        for g in 0..n {
            let next = BlockId::new(Gid::new((g + 1) % n), 0);
            m.add(Gid::new(g), g as u64, [next].into_iter().collect()).unwrap();
        }
        m
    }

    #[test]
    fn duplicate_gid_is_rejected() {
        let mut m: Master<u64, NoComm> = Master::new(NoComm);
        m.add(Gid::new(4), 1, Link::new()).unwrap();
        let err = m.add(Gid::new(4), 2, Link::new()).unwrap_err();
        assert!(matches!(err, BlockError::DuplicateGid(g) if g == Gid::new(4)));
        assert_eq!(m.size(), 1);
    }

    #[test]
    fn release_reindexes() {
        let mut m = ring(3);
        let (gid, block, _) = m.release(0).unwrap();
        assert_eq!((gid, block), (Gid::new(0), 0));
        assert_eq!(m.lid(Gid::new(2)), Some(1));
        assert!(!m.local(Gid::new(0)));
        assert!(m.validate_invariants().is_ok());
    }

    #[test]
    fn foreach_errors_propagate() {
        let mut m = ring(4);
        let err = m
            .foreach(|b, _| {
                if *b == 2 {
                    Err(BlockError::Callback("boom".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, BlockError::Callback(_)));
    }

    #[test]
    fn threaded_foreach_touches_every_block_once() {
        let mut m: Master<u64, NoComm> = Master::with_config(
            NoComm,
            MasterConfig {
                threads: 4,
                limit: None,
            },
        )
        .unwrap();
        for g in 0..64 {
            m.add(Gid::new(g), 0, Link::new()).unwrap();
        }
        m.foreach(|b, p| {
            *b += 1 + p.gid().get() as u64;
            Ok(())
        })
        .unwrap();
        for i in 0..64 {
            assert_eq!(m.resident_block(i), Some(&(i as u64 + 1)));
        }
    }

    #[test]
    fn lru_limit_keeps_few_blocks_resident() {
        let mut m: Master<Vec<u32>, NoComm> = Master::with_config(
            NoComm,
            MasterConfig {
                threads: 1,
                limit: Some(2),
            },
        )
        .unwrap()
        .with_storage(MemoryStorage::new(), BlockCodec::bincode());
        for g in 0..5u32 {
            m.add(Gid::new(g as usize), vec![g; 3], Link::new()).unwrap();
            assert!(m.in_memory() <= 2);
        }
        m.foreach(|b, _| {
            b.push(99);
            Ok(())
        })
        .unwrap();
        assert!(m.in_memory() <= 2);
        for i in 0..5 {
            let b = m.block(i).unwrap().clone();
            assert_eq!(b, vec![i as u32, i as u32, i as u32, 99]);
        }
    }

    #[test]
    fn failed_load_keeps_the_payload() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let fail_once = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&fail_once);
        let codec = BlockCodec::new(
            |b: &u64| Ok(b.to_le_bytes().to_vec()),
            move |bytes: &[u8]| {
                if flag.swap(false, Ordering::SeqCst) {
                    return Err(BlockError::Callback("decode failed".into()));
                }
                let mut le = [0u8; 8];
                le.copy_from_slice(bytes);
                Ok(u64::from_le_bytes(le))
            },
        );
        let storage = MemoryStorage::new();
        let mut m: Master<u64, NoComm> = Master::new(NoComm).with_storage(storage, codec);
        m.add(Gid::new(0), 41, Link::new()).unwrap();
        m.unload(0).unwrap();

        assert!(matches!(m.load(0), Err(BlockError::Callback(_))));
        assert!(!m.is_resident(0));
        m.load(0).unwrap();
        assert_eq!(m.resident_block(0), Some(&41));
        assert!(!fail_once.load(Ordering::SeqCst));

        m.unload(0).unwrap();
        m.load(0).unwrap();
        assert_eq!(m.resident_block(0), Some(&41));
    }

    #[test]
    fn skip_no_incoming_visits_nothing_after_quiet_exchange() {
        let mut m = ring(3);
        m.exchange().unwrap();
        m.foreach_skip(
            |_, _| Err(BlockError::Callback("should be skipped".into())),
            &SkipNoIncoming,
        )
        .unwrap();
    }
}
