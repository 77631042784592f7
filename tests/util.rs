#![allow(dead_code)]
use blockpar::algs::communicator::RayonComm;
use blockpar::master::Master;
use blockpar::partitioning::assigner::Assigner;
use blockpar::partitioning::decomposer::RegularDecomposer;
use blockpar::topology::bounds::DiscreteBounds;
use blockpar::topology::link::RegularLink;
use std::path::PathBuf;
use std::thread;

/// Run `f(comm)` once per rank of a fresh `n`-rank universe, each on its own
/// thread, and return the results in rank order.
pub fn run_ranks<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(RayonComm) -> R + Sync,
{
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = RayonComm::universe(n)
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// 1-D domain `[0, 10 * nblocks - 1]` cut into `nblocks` blocks.
pub fn line(nblocks: usize) -> RegularDecomposer<i64> {
    let domain = DiscreteBounds::new(vec![0], vec![10 * nblocks as i64 - 1]).unwrap();
    RegularDecomposer::new(domain, nblocks).unwrap()
}

/// Master holding this rank's blocks of `decomposer`; each block starts as
/// `init(gid)`.
pub fn populate<B: Send>(
    comm: RayonComm,
    decomposer: &RegularDecomposer<i64>,
    assigner: &dyn Assigner,
    init: impl Fn(usize) -> B,
) -> Master<B, RayonComm, RegularLink<i64>> {
    let rank = blockpar::algs::communicator::Communicator::rank(&comm);
    let mut master = Master::new(comm);
    decomposer
        .decompose(rank, assigner, |gid, _core, _bounds, _domain, link| {
            master.add(gid, init(gid.get()), link).map(|_| ())
        })
        .unwrap();
    master
}

/// Scratch location unique to this process.
pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("blockpar-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}
