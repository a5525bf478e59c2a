//! End-to-end balancing scenarios per strategy: uniform-load behavior,
//! monotone convergence under skewed loads, kd-tree sub-box shapes, and the
//! tuning command surface.

mod common;

use common::{build, gather_local_cells, gather_u64_lists, run_ranks};
use pargrid::prelude::*;

/// Uniform weights on a balanced diffusion grid move nothing.
#[test]
fn diffusion_uniform_load_is_stable() {
    let results = run_ranks(8, |comm| {
        let mut grid = build(GridStrategy::Diffusion, comm.clone(), [1.0, 1.0, 1.0], 0.1);
        let n = grid.n_local_cells() as usize;
        let changed = grid
            .repartition(&move || vec![1.0; n], &mut || {})
            .unwrap();

        let locals = gather_local_cells(&comm, &grid, 0x160);
        (changed, grid.n_local_cells() as u64, locals)
    });

    let total: u64 = results.iter().map(|(_, c, _)| c).sum();
    assert_eq!(total, 1000);
    for (changed, _, locals) in &results {
        assert!(!changed, "uniform load must not move cells");
        let mut all: Vec<u64> = locals.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }
}

/// A loaded rank sheds cells to its neighbors over diffusion rounds.
#[test]
fn diffusion_sheds_load_from_a_hot_rank() {
    let results = run_ranks(8, |comm| {
        let mut grid = build(GridStrategy::Diffusion, comm.clone(), [4.0, 4.0, 4.0], 1.0);
        let me = comm.rank();
        let mut counts = vec![grid.n_local_cells()];
        for _ in 0..4 {
            let n = grid.n_local_cells() as usize;
            let w = if me == 0 { 100.0 } else { 1.0 };
            let _ = grid.repartition(&move || vec![w; n], &mut || {}).unwrap();
            counts.push(grid.n_local_cells());
        }
        counts
    });

    let rank0 = &results[0];
    assert!(
        rank0.last().unwrap() < rank0.first().unwrap(),
        "hot rank kept its cells: {rank0:?}"
    );
    for w in rank0.windows(2) {
        assert!(w[1] <= w[0], "hot rank grew: {rank0:?}");
    }
}

/// Octagon shrink under a one-octant load, and unique box-wide ownership of
/// random positions after every round.
#[test]
fn gridbased_shrinks_the_loaded_octant() {
    let results = run_ranks(8, |comm| {
        let mut grid = build(GridStrategy::GridBased, comm.clone(), [4.0, 4.0, 4.0], 1.0);

        let mut counts = vec![grid.n_local_cells()];
        for round in 0..10 {
            // Weight 1 for cells centered in the lower octant, 0 elsewhere.
            let weights: Vec<f64> = (0..grid.n_local_cells())
                .map(|i| {
                    let cell = grid
                        .global_hash(CellIndex::Local(LocalCell::new(i)))
                        .unwrap()
                        .get();
                    let coords = [cell % 4, cell / 4 % 4, cell / 16];
                    if coords.iter().all(|&c| c < 2) { 1.0 } else { 0.0 }
                })
                .collect();
            let _ = grid
                .repartition(&move || weights.clone(), &mut || {})
                .unwrap();
            counts.push(grid.n_local_cells());

            // Every probe position is claimed by exactly one rank.
            let probes: Vec<[f64; 3]> = (0..32)
                .map(|i| {
                    let t = (i * 7 + round * 13) as f64;
                    [
                        (t * 0.37).fract() * 4.0,
                        (t * 0.61).fract() * 4.0,
                        (t * 0.83).fract() * 4.0,
                    ]
                })
                .collect();
            let claims: Vec<u64> = probes
                .iter()
                .map(|&p| {
                    (grid.position_to_rank(p).ok() == Some(Rank::new(comm.rank() as u32))) as u64
                })
                .collect();
            let gathered = gather_u64_lists(&comm, 0x170 + round as u16 * 4, &claims);
            for i in 0..probes.len() {
                let owners: u64 = gathered.iter().map(|c| c[i]).sum();
                assert_eq!(owners, 1, "probe {i} claimed by {owners} ranks");
            }
        }
        counts
    });

    let rank0 = &results[0];
    for w in rank0.windows(2) {
        assert!(w[1] <= w[0], "loaded octagon grew: {rank0:?}");
    }
    assert!(
        rank0.last().unwrap() < rank0.first().unwrap(),
        "loaded octagon never shrank: {rank0:?}"
    );
}

/// The mu factor is settable within its range and rejected outside it.
#[test]
fn gridbased_mu_command_bounds() {
    let comm = std::sync::Arc::new(NoComm);
    let mut grid = make_pargrid(
        GridStrategy::GridBased,
        comm,
        [4.0, 4.0, 4.0],
        1.0,
        ExtraParams::default(),
    )
    .unwrap();

    grid.command("set mu 0.3").unwrap();
    grid.command("set mu 0.5").unwrap();
    assert!(matches!(
        grid.command("set mu 0.7"),
        Err(GridError::InvalidCommandArgument { .. })
    ));
    assert!(matches!(
        grid.command("set mu 0"),
        Err(GridError::InvalidCommandArgument { .. })
    ));
    assert!(matches!(
        grid.command("set nu 0.1"),
        Err(GridError::UnknownCommand(_))
    ));
}

/// Even split under uniform weights, then monotone shrink of a
/// double-weighted rank.
#[test]
fn sfc_balances_by_weight() {
    let results = run_ranks(4, |comm| {
        let mut grid = build(GridStrategy::Sfc, comm.clone(), [16.0, 16.0, 16.0], 1.0);
        assert_eq!(grid.n_local_cells(), 1024);

        let me = comm.rank();
        let mut counts = vec![grid.n_local_cells()];
        for _ in 0..3 {
            let n = grid.n_local_cells() as usize;
            let w = if me == 0 { 2.0 } else { 1.0 };
            let _ = grid.repartition(&move || vec![w; n], &mut || {}).unwrap();
            counts.push(grid.n_local_cells());
        }
        counts
    });

    let rank0 = &results[0];
    assert!(rank0[1] < rank0[0], "double-weighted rank did not shrink");
    for w in rank0.windows(2) {
        assert!(w[1] <= w[0], "double-weighted rank grew: {rank0:?}");
    }
    // Totals stay complete after every round.
    for round in 0..4 {
        let total: u32 = results.iter().map(|c| c[round]).sum();
        assert_eq!(total, 4096);
    }
}

/// Converged kd-tree and SFC grids are idempotent under constant weights.
#[test]
fn kdtree_and_sfc_idempotent_on_uniform_load() {
    for strategy in [GridStrategy::KdTree, GridStrategy::Sfc] {
        let results = run_ranks(8, move |comm| {
            let mut grid = build(strategy, comm, [4.0, 4.0, 4.0], 1.0);
            let n = grid.n_local_cells() as usize;
            grid.repartition(&move || vec![1.0; n], &mut || {}).unwrap()
        });
        for changed in results {
            assert!(!changed, "{strategy:?}: uniform load moved cells");
        }
    }
}

/// Uniform kd-tree decomposition of a cube: every rank holds a 2x2x2
/// sub-box with all seven other ranks as neighbors, and every ghost cell is
/// a local cell of its owner.
#[test]
fn kdtree_uniform_cube_decomposition() {
    let results = run_ranks(8, |comm| {
        let grid = build(GridStrategy::KdTree, comm.clone(), [4.0, 4.0, 4.0], 1.0);
        assert_eq!(grid.n_local_cells(), 8);
        assert_eq!(grid.neighbor_ranks().len(), 7);

        // The local cells form a 2x2x2 coordinate box.
        let coords: Vec<[u64; 3]> = (0..8)
            .map(|i| {
                let c = grid
                    .global_hash(CellIndex::Local(LocalCell::new(i)))
                    .unwrap()
                    .get();
                [c % 4, c / 4 % 4, c / 16]
            })
            .collect();
        for d in 0..3 {
            let lo = coords.iter().map(|c| c[d]).min().unwrap();
            let hi = coords.iter().map(|c| c[d]).max().unwrap();
            assert_eq!(hi - lo, 1, "sub-box is not 2 cells wide");
        }

        // Ghost identities per peer, to be checked against owners' locals.
        let ghosts: Vec<u64> = grid
            .get_boundary_info()
            .iter()
            .flat_map(|desc| {
                desc.recv.iter().map(|&g| {
                    let id = grid.global_hash(CellIndex::Ghost(g)).unwrap().get();
                    (desc.dest.get() as u64) << 32 | id
                })
            })
            .collect();
        let all_ghosts = gather_u64_lists(&comm, 0x1b0, &ghosts);
        let all_locals = gather_local_cells(&comm, &grid, 0x1b4);
        for ghost_list in &all_ghosts {
            for &packed in ghost_list {
                let owner = (packed >> 32) as usize;
                let id = packed & 0xffff_ffff;
                assert!(
                    all_locals[owner].contains(&id),
                    "ghost {id} is not local on its owner {owner}"
                );
            }
        }
        true
    });
    assert!(results.into_iter().all(|ok| ok));
}

/// The hybrid switcher toggles between its implementations and keeps the
/// partition intact across the handover.
#[test]
fn hybrid_toggles_between_strategies() {
    let results = run_ranks(8, |comm| {
        let mut grid = build(GridStrategy::Hybrid, comm.clone(), [4.0, 4.0, 4.0], 1.0);
        assert!(matches!(
            grid.command("explode"),
            Err(GridError::UnknownCommand(_))
        ));

        let before: u32 = grid.n_local_cells();

        // Switch to the graph partitioner; uniform weights keep the count
        // balanced.
        grid.command("toggle").unwrap();
        let n = grid.n_local_cells() as usize;
        let _ = grid.repartition(&move || vec![1.0; n], &mut || {}).unwrap();
        let graph_count = grid.n_local_cells();

        // And back to diffusion.
        grid.command("toggle").unwrap();
        let n = grid.n_local_cells() as usize;
        let _ = grid.repartition(&move || vec![1.0; n], &mut || {}).unwrap();

        let locals = gather_local_cells(&comm, &grid, 0x1c0);
        (before, graph_count, grid.n_local_cells(), locals)
    });

    for (_, graph_count, final_count, locals) in &results {
        assert!(*graph_count > 0);
        assert!(*final_count > 0);
        let mut all: Vec<u64> = locals.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..64).collect::<Vec<_>>());
    }
}

/// Graph repartitioning balances cell counts under uniform weights.
#[test]
fn graph_balances_uniform_load() {
    let results = run_ranks(4, |comm| {
        let mut grid = build(GridStrategy::Graph, comm, [4.0, 4.0, 4.0], 1.0);
        let n = grid.n_local_cells() as usize;
        let _ = grid.repartition(&move || vec![1.0; n], &mut || {}).unwrap();
        grid.n_local_cells()
    });
    assert_eq!(results.iter().sum::<u32>(), 64);
    for count in results {
        assert_eq!(count, 16, "uniform graph split is unbalanced");
    }
}
