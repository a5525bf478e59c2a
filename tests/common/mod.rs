//! Shared harness for the multi-rank test suites: one thread per rank over
//! a `ThreadComm` world, plus cross-rank gathering of observations.
#![allow(dead_code)] // not every suite uses every helper

use std::sync::Arc;

use pargrid::comm::collectives::all_gather_bytes;
use pargrid::comm::CommTag;
use pargrid::prelude::*;

/// Runs `f` once per rank, each on its own thread, and returns the results
/// in rank order.
pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Arc<ThreadComm>) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = ThreadComm::world(size)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(Arc::new(comm)))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Strategies that run in any multi-rank configuration.
pub fn all_strategies() -> Vec<GridStrategy> {
    vec![
        GridStrategy::Cart,
        GridStrategy::Graph,
        GridStrategy::Diffusion,
        GridStrategy::GridBased,
        GridStrategy::KdTree,
        GridStrategy::Sfc,
        GridStrategy::Hybrid,
    ]
}

pub fn build(
    strategy: GridStrategy,
    comm: Arc<ThreadComm>,
    box_size: [f64; 3],
    min_cell_size: f64,
) -> ParallelLcGrid<ThreadComm> {
    make_pargrid(strategy, comm, box_size, min_cell_size, ExtraParams::default())
        .expect("grid construction failed")
}

/// Gathers each rank's local cell identities (via `global_hash`) on every
/// rank, ordered by rank.
pub fn gather_local_cells(
    comm: &ThreadComm,
    grid: &ParallelLcGrid<ThreadComm>,
    tag: u16,
) -> Vec<Vec<u64>> {
    let mine: Vec<u64> = (0..grid.n_local_cells())
        .map(|i| {
            grid.global_hash(CellIndex::Local(LocalCell::new(i)))
                .unwrap()
                .get()
        })
        .collect();
    gather_u64_lists(comm, tag, &mine)
}

/// Gathers one `u64` list per rank.
pub fn gather_u64_lists(comm: &ThreadComm, tag: u16, mine: &[u64]) -> Vec<Vec<u64>> {
    let bytes: Vec<u8> = mine.iter().flat_map(|v| v.to_le_bytes()).collect();
    all_gather_bytes(comm, CommTag::new(tag), &bytes)
        .into_iter()
        .map(|b| {
            b.chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect()
        })
        .collect()
}

