mod util;

use blockpar::prelude::*;
use blockpar::storage::ResidentBlock;
use serial_test::serial;
use util::{run_ranks, scratch};

fn ring_master<S: ExternalStorage + 'static>(
    comm: RayonComm,
    n: usize,
    limit: usize,
    storage: S,
) -> Master<Vec<u64>, RayonComm> {
    let (rank, size) = (comm.rank(), comm.size());
    let assigner = ContiguousAssigner::new(size, n).unwrap();
    let config = MasterConfig { threads: 1, limit: Some(limit) };
    let mut master = Master::with_config(comm, config)
        .unwrap()
        .with_storage(storage, BlockCodec::bincode());
    for gid in assigner.local_gids(rank) {
        let next = Gid::new((gid.get() + 1) % n);
        let link: Link = [BlockId::new(next, assigner.rank(next).unwrap())]
            .into_iter()
            .collect();
        master.add(gid, vec![gid.get() as u64; 64], link).unwrap();
        assert!(master.in_memory() <= limit);
    }
    master
}

fn pass_first_element(master: &mut Master<Vec<u64>, RayonComm>) {
    master
        .foreach(|b, p| {
            let to = p.link().target(0).ok_or(BlockError::Callback("no neighbor".into()))?;
            p.enqueue(to, &b[0])
        })
        .unwrap();
    master.exchange().unwrap();
    master
        .foreach(|b, p| {
            for from in p.incoming_gids() {
                let v: u64 = p.dequeue(from)?;
                b.push(v);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
#[serial]
fn file_backed_ring_keeps_the_limit() {
    let n = 6;
    let prefix = scratch("ooc-ring");
    let results = run_ranks(1, |comm| {
        let mut master = ring_master(comm, n, 2, FileStorage::new(&prefix));
        assert_eq!(master.in_memory(), 2);
        pass_first_element(&mut master);
        assert!(master.in_memory() <= 2);
        let mut out = Vec::new();
        for i in 0..master.size() {
            let gid = master.gid(i).unwrap().get() as u64;
            let block = master.block(i).unwrap().clone();
            out.push((gid, block));
        }
        out
    });
    for (gid, block) in results.into_iter().flatten() {
        assert_eq!(block.len(), 65);
        assert!(block[..64].iter().all(|&x| x == gid));
        assert_eq!(block[64], (gid + n as u64 - 1) % n as u64);
    }
}

#[test]
fn memory_backed_blocks_survive_across_ranks() {
    let n = 8;
    let results = run_ranks(2, |comm| {
        let mut master = ring_master(comm, n, 1, MemoryStorage::new());
        pass_first_element(&mut master);
        assert!(master.in_memory() <= 1);
        (0..master.size())
            .map(|i| {
                let gid = master.gid(i).unwrap().get() as u64;
                (gid, *master.block(i).unwrap().last().unwrap())
            })
            .collect::<Vec<_>>()
    });
    for (gid, last) in results.into_iter().flatten() {
        assert_eq!(last, (gid + n as u64 - 1) % n as u64);
    }
}

#[test]
fn unload_and_load_by_hand() {
    let results = run_ranks(1, |comm| {
        let mut master = ring_master(comm, 3, 3, MemoryStorage::new());
        assert_eq!(master.in_memory(), 3);
        master.unload(1).unwrap();
        assert!(!master.is_resident(1));
        assert!(master.resident_block(1).is_none());
        master.load(1).unwrap();
        master.resident_block(1).cloned()
    });
    assert_eq!(results[0], Some(vec![1u64; 64]));
}

/// Keeps only even gids in memory.
#[derive(Debug)]
struct EvenOnly;

impl EvictionPolicy for EvenOnly {
    fn limit(&self) -> Option<usize> {
        None
    }

    fn victims(&self, resident: &[ResidentBlock]) -> Vec<usize> {
        resident
            .iter()
            .filter(|r| r.gid.get() % 2 == 1)
            .map(|r| r.index)
            .collect()
    }
}

#[test]
fn custom_policies_decide_what_leaves() {
    let results = run_ranks(1, |comm| {
        let mut master = ring_master(comm, 6, 6, MemoryStorage::new()).with_eviction_policy(EvenOnly);
        master.foreach(|_, _| Ok(())).unwrap();
        (0..master.size()).map(|i| master.is_resident(i)).collect::<Vec<_>>()
    });
    assert_eq!(results[0], vec![true, false, true, false, true, false]);
}

#[test]
fn iexchange_runs_out_of_core() {
    let n = 6;
    let totals = run_ranks(2, |comm| {
        let mut master = ring_master(comm, n, 1, MemoryStorage::new());
        master
            .foreach(|_, p| {
                if p.gid() == Gid::new(0) {
                    let to = p.link().target(0).ok_or(BlockError::Callback("no neighbor".into()))?;
                    p.enqueue(to, &9u32)?;
                }
                Ok(())
            })
            .unwrap();
        master
            .iexchange(|b, p| {
                p.fill_incoming()?;
                for from in p.incoming_gids() {
                    while p.incoming(from) {
                        let hops: u32 = p.dequeue(from)?;
                        b.push(hops as u64);
                        if hops > 0 {
                            let to = p.link().target(0).ok_or(BlockError::Callback("no neighbor".into()))?;
                            p.enqueue(to, &(hops - 1))?;
                        }
                    }
                }
                Ok(true)
            })
            .unwrap();
        assert!(master.in_memory() <= 1);
        (0..master.size())
            .map(|i| master.block(i).unwrap().len() - 64)
            .sum::<usize>()
    });
    assert_eq!(totals.iter().sum::<usize>(), 10);
}

#[test]
#[serial]
fn file_payload_survives_a_failed_decode() {
    let dir = scratch("ooc-failed-decode");
    std::fs::create_dir_all(&dir).unwrap();
    let files = || std::fs::read_dir(&dir).unwrap().count();
    let flag = std::sync::atomic::AtomicBool::new(true);
    let codec = BlockCodec::new(
        |b: &Vec<u64>| Ok(bincode::serialize(b)?),
        move |bytes: &[u8]| {
            if flag.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(BlockError::Callback("decode failed".into()));
            }
            Ok(bincode::deserialize(bytes)?)
        },
    );
    let mut master: Master<Vec<u64>, NoComm> =
        Master::new(NoComm).with_storage(FileStorage::new(dir.join("blk")), codec);
    master.add(Gid::new(0), vec![7; 16], Link::new()).unwrap();
    master.unload(0).unwrap();
    assert_eq!(files(), 1);

    assert!(master.load(0).is_err());
    assert_eq!(files(), 1);
    master.load(0).unwrap();
    assert_eq!(master.resident_block(0), Some(&vec![7; 16]));
    assert_eq!(files(), 0);
}
