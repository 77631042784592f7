use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use blockpar::prelude::*;

type GridMaster<C> = Master<Vec<f64>, C, RegularLink<i64>>;

fn grid(nblocks: usize) -> RegularDecomposer<i64> {
    let domain = DiscreteBounds::new(vec![0, 0], vec![255, 255]).unwrap();
    let config = DecomposerConfig {
        wrap: vec![true, true],
        ..Default::default()
    };
    RegularDecomposer::with_config(domain, nblocks, config).unwrap()
}

fn build<C: Communicator>(comm: C, decomposer: &RegularDecomposer<i64>, payload: usize) -> GridMaster<C> {
    let rank = comm.rank();
    let assigner = ContiguousAssigner::new(comm.size(), decomposer.nblocks()).unwrap();
    let mut rng = SmallRng::seed_from_u64(42 + rank as u64);
    let mut master = Master::new(comm);
    decomposer
        .decompose(rank, &assigner, |gid, _, _, _, link| {
            let block: Vec<f64> = (0..payload).map(|_| rng.r#gen::<f64>()).collect();
            master.add(gid, block, link).map(|_| ())
        })
        .unwrap();
    master
}

fn round_trip<C: Communicator>(master: &mut GridMaster<C>) -> f64 {
    master
        .foreach(|b, p| {
            for nbr in p.link().neighbors().to_vec() {
                p.enqueue(nbr, &*b)?;
            }
            Ok(())
        })
        .unwrap();
    master.exchange().unwrap();
    master
        .foreach(|b, p| {
            for from in p.incoming_gids() {
                let theirs: Vec<f64> = p.dequeue(from)?;
                b[0] = 0.5 * (b[0] + theirs[0]);
            }
            Ok(())
        })
        .unwrap();
    (0..master.size())
        .filter_map(|i| master.resident_block(i).map(|b| b[0]))
        .sum()
}

fn bench_local_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange_local");
    for &(nblocks, payload) in &[(16usize, 64usize), (64, 64), (64, 4096)] {
        let decomposer = grid(nblocks);
        let mut master = build(NoComm, &decomposer, payload);
        group.bench_with_input(
            BenchmarkId::new(format!("b{nblocks}"), payload),
            &payload,
            |b, _| b.iter(|| black_box(round_trip(&mut master))),
        );
    }
    group.finish();
}

fn bench_threaded_ranks(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange_ranks");
    group.sample_size(20);
    for &ranks in &[2usize, 4] {
        let decomposer = grid(64);
        group.bench_with_input(BenchmarkId::new("ranks", ranks), &ranks, |b, &ranks| {
            b.iter(|| {
                std::thread::scope(|s| {
                    let handles: Vec<_> = RayonComm::universe(ranks)
                        .into_iter()
                        .map(|comm| {
                            let decomposer = &decomposer;
                            s.spawn(move || {
                                let mut master = build(comm, decomposer, 256);
                                round_trip(&mut master)
                            })
                        })
                        .collect();
                    let total: f64 = handles.into_iter().filter_map(|h| h.join().ok()).sum();
                    black_box(total)
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_local_exchange, bench_threaded_ranks);
criterion_main!(benches);
