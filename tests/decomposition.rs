mod util;

use blockpar::prelude::*;
use util::run_ranks;

fn volume(b: &DiscreteBounds) -> i64 {
    (0..b.dim()).map(|a| b.max[a] - b.min[a] + 1).product()
}

#[test]
fn cores_tile_the_domain_across_ranks() {
    let domain = DiscreteBounds::new(vec![0, 0, 0], vec![19, 14, 9]).unwrap();
    let decomposer = RegularDecomposer::new(domain.clone(), 12).unwrap();
    let cores = run_ranks(4, |comm| {
        let assigner = ContiguousAssigner::new(4, 12).unwrap();
        let mut out = Vec::new();
        decomposer
            .decompose(comm.rank(), &assigner, |gid, core, bounds, dom, link| {
                assert_eq!(dom, decomposer.domain());
                assert_eq!(core, bounds);
                assert!(link.neighbors().iter().all(|n| n.gid != gid));
                out.push((gid, core));
                Ok(())
            })
            .unwrap();
        out
    });
    let cores: Vec<(Gid, DiscreteBounds)> = cores.into_iter().flatten().collect();
    assert_eq!(cores.len(), 12);
    assert_eq!(cores.iter().map(|(_, c)| volume(c)).sum::<i64>(), volume(&domain));
    for (i, (ga, a)) in cores.iter().enumerate() {
        for (gb, b) in &cores[i + 1..] {
            assert!(!a.intersects(b), "{ga} and {gb} overlap");
        }
    }
    for (gid, core) in &cores {
        assert_eq!(decomposer.point_to_gid(&core.min), Some(*gid));
        assert_eq!(decomposer.point_to_gid(&core.max), Some(*gid));
    }
}

#[test]
fn periodic_grid_gives_every_block_eight_neighbors() {
    let domain = DiscreteBounds::new(vec![0, 0], vec![8, 8]).unwrap();
    let config = DecomposerConfig {
        wrap: vec![true, true],
        ghosts: vec![1, 1],
        ..Default::default()
    };
    let decomposer = RegularDecomposer::with_config(domain, 9, config).unwrap();
    let counts = run_ranks(3, |comm| {
        let assigner = RoundRobinAssigner::new(3, 9).unwrap();
        let rank = comm.rank();
        let mut master: Master<Vec<u64>, RayonComm, RegularLink<i64>> = Master::new(comm);
        decomposer
            .decompose(rank, &assigner, |gid, _, bounds, _, link| {
                assert_eq!(link.size(), 8);
                assert_eq!(link.size_unique(), 8);
                assert_eq!(volume(&bounds), 25);
                master.add(gid, Vec::new(), link).map(|_| ())
            })
            .unwrap();

        // Every block tells each neighbor which direction it sits in.
        master
            .foreach(|_, p| {
                for i in 0..p.link().size() {
                    let dir = p.link().direction(i).unwrap().clone();
                    let to = p.link().target(i).unwrap();
                    p.enqueue(to, &dir.as_slice().to_vec())?;
                }
                Ok(())
            })
            .unwrap();
        master.exchange().unwrap();
        master
            .foreach(|b, p| {
                for from in p.incoming_gids() {
                    let dir: Vec<i32> = p.dequeue(from)?;
                    let mine = p.link().find(from).ok_or(BlockError::UnknownBlock(from))?;
                    assert_eq!(p.link().direction(mine).unwrap().opposite().as_slice(), &dir[..]);
                    b.push(from.get() as u64);
                }
                Ok(())
            })
            .unwrap();
        (0..master.size())
            .map(|i| master.resident_block(i).unwrap().len())
            .collect::<Vec<_>>()
    });
    assert!(counts.into_iter().flatten().all(|c| c == 8));
}

#[test]
fn continuous_domains_share_faces() {
    let domain = ContinuousBounds::new(vec![0.0, 0.0], vec![1.0, 2.0]).unwrap();
    let decomposer = RegularDecomposer::new(domain, 4).unwrap();
    let assigner = ContiguousAssigner::new(1, 4).unwrap();
    let mut cores = Vec::new();
    decomposer
        .decompose(0, &assigner, |_, core, _, _, _| {
            cores.push(core);
            Ok(())
        })
        .unwrap();
    let area: f64 = cores
        .iter()
        .map(|c| (c.max[0] - c.min[0]) * (c.max[1] - c.min[1]))
        .sum();
    assert!((area - 2.0).abs() < 1e-12);
    assert_eq!(cores[0].max[0], cores[1].min[0]);
}

#[test]
fn assigner_mismatch_is_a_configuration_error() {
    let decomposer = util::line(4);
    let assigner = ContiguousAssigner::new(1, 5).unwrap();
    let err = decomposer.decompose(0, &assigner, |_, _, _, _, _| Ok(())).unwrap_err();
    assert!(matches!(err, BlockError::Configuration(_)));
}
