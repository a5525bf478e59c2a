//! Checks that the number and geometry of cells is meaningful on every
//! strategy: per-rank counts sum to the grid volume, grid and cell sizes
//! multiply back to the box extents.

mod common;

use std::sync::Arc;

use common::{all_strategies, build, gather_local_cells, run_ranks};
use pargrid::prelude::*;

fn is_close(a: f64, b: f64) -> bool {
    ((a - b) / a.min(b)).abs() < 1e-12
}

#[test]
fn single_rank_cart_baseline() {
    let comm = Arc::new(NoComm);
    let grid = make_pargrid(
        GridStrategy::Cart,
        comm,
        [1.0, 1.0, 1.0],
        0.1,
        ExtraParams::default(),
    )
    .unwrap();

    assert_eq!(grid.grid_size(), [10, 10, 10]);
    assert_eq!(grid.n_local_cells(), 1000);
    assert_eq!(grid.n_ghost_cells(), 0);
    assert!(grid.neighbor_ranks().is_empty());
    assert!(grid.get_boundary_info().is_empty());
}

#[test]
fn cell_counts_across_strategies() {
    for strategy in all_strategies() {
        let counts = run_ranks(8, move |comm| {
            let grid = build(strategy, comm, [4.0, 4.0, 4.0], 1.0);

            let grid_size = grid.grid_size();
            let cell_size = grid.cell_size();
            for d in 0..3 {
                assert!(grid_size[d] > 0);
                assert!(cell_size[d] > 0.0);
                assert!(is_close(grid_size[d] as f64 * cell_size[d], 4.0));
            }
            grid.n_local_cells() as u64
        });
        let total: u64 = counts.iter().sum();
        assert_eq!(total, 64, "{strategy:?}: cell count mismatch");
        assert!(
            counts.iter().all(|&c| c > 0),
            "{strategy:?}: some rank owns no cells"
        );
    }
}

#[test]
fn cell_counts_preserved_by_repartitioning() {
    for strategy in all_strategies() {
        let results = run_ranks(8, move |comm| {
            let mut grid = build(strategy, comm.clone(), [4.0, 4.0, 4.0], 1.0);

            // Skewed but deterministic weights.
            let n = grid.n_local_cells() as usize;
            let rank = comm.rank() as f64;
            let metric = move || {
                (0..n)
                    .map(|i| 1.0 + rank + (i % 3) as f64)
                    .collect::<Vec<_>>()
            };
            let mut started = false;
            let changed = grid.repartition(&metric, &mut || started = true).unwrap();
            assert_eq!(changed, started, "callback must fire exactly on change");

            let locals = gather_local_cells(&comm, &grid, 0x100);
            (changed, grid.n_local_cells() as u64, locals)
        });

        let total: u64 = results.iter().map(|(_, c, _)| c).sum();
        assert_eq!(total, 64, "{strategy:?}: cell count changed");

        // Ownership stays a partition: the gathered sets agree on every rank
        // and are disjoint.
        let reference = &results[0].2;
        let mut all: Vec<u64> = reference.iter().flatten().copied().collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64, "{strategy:?}: duplicate or missing cells");
    }
}
