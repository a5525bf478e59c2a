//! Position resolution across strategies: every position in the box is
//! owned by exactly one rank, rank answers agree wherever they are defined,
//! and out-of-box positions are rejected.

mod common;

use common::{all_strategies, build, gather_u64_lists, run_ranks};
use pargrid::prelude::*;

fn probes() -> Vec<[f64; 3]> {
    let mut out = Vec::new();
    for i in 0..40u32 {
        let t = i as f64;
        out.push([
            (t * 0.731).fract() * 4.0,
            (t * 0.517).fract() * 4.0,
            (t * 0.293).fract() * 4.0,
        ]);
    }
    out.push([0.0, 0.0, 0.0]);
    out.push([3.999, 3.999, 3.999]);
    out
}

#[test]
fn positions_resolve_to_exactly_one_owner() {
    for strategy in all_strategies() {
        let gathered = run_ranks(8, move |comm| {
            let grid = build(strategy, comm.clone(), [4.0, 4.0, 4.0], 1.0);
            let me = Rank::new(comm.rank() as u32);

            let mut claims = Vec::new();
            for p in probes() {
                let cell = grid.position_to_cell_index(p);
                let rank = grid.position_to_rank(p);
                match (&cell, &rank) {
                    // Owning the cell means resolving the rank to oneself.
                    (Ok(_), Ok(r)) => {
                        assert_eq!(*r, me, "{strategy:?}: rank/cell disagree at {p:?}")
                    }
                    (Ok(_), Err(e)) => {
                        panic!("{strategy:?}: owned cell but rank failed: {e:?}")
                    }
                    (Err(GridError::NotLocal { .. }), _) => {}
                    (other, _) => panic!("{strategy:?}: unexpected result {other:?}"),
                }
                claims.push(cell.is_ok() as u64);
            }
            gather_u64_lists(&comm, 0x1e0, &claims)
        });

        let per_rank = &gathered[0];
        for i in 0..probes().len() {
            let owners: u64 = per_rank.iter().map(|c| c[i]).sum();
            assert_eq!(owners, 1, "{strategy:?}: probe {i} has {owners} owners");
        }
    }
}

#[test]
fn rank_answers_agree_where_defined() {
    for strategy in all_strategies() {
        let gathered = run_ranks(8, move |comm| {
            let grid = build(strategy, comm.clone(), [4.0, 4.0, 4.0], 1.0);
            // Encode Ok(rank) as rank, undefined as u64::MAX.
            let answers: Vec<u64> = probes()
                .iter()
                .map(|&p| match grid.position_to_rank(p) {
                    Ok(r) => r.get() as u64,
                    Err(GridError::NotLocal { .. }) => u64::MAX,
                    Err(e) => panic!("{strategy:?}: unexpected error {e:?}"),
                })
                .collect();
            gather_u64_lists(&comm, 0x1f0, &answers)
        });

        let per_rank = &gathered[0];
        for i in 0..probes().len() {
            let defined: Vec<u64> = per_rank
                .iter()
                .map(|a| a[i])
                .filter(|&a| a != u64::MAX)
                .collect();
            assert!(!defined.is_empty(), "{strategy:?}: probe {i} unresolvable");
            assert!(
                defined.windows(2).all(|w| w[0] == w[1]),
                "{strategy:?}: probe {i} resolved to different ranks: {defined:?}"
            );
        }
    }
}

#[test]
fn neighbor_index_resolution() {
    for strategy in all_strategies() {
        run_ranks(8, move |comm| {
            let grid = build(strategy, comm.clone(), [4.0, 4.0, 4.0], 1.0);
            let me = Rank::new(comm.rank() as u32);
            for p in probes() {
                let owner = match grid.position_to_rank(p) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                match grid.position_to_neighidx(p) {
                    Ok(idx) => {
                        assert_eq!(grid.neighbor_ranks()[idx], owner, "{strategy:?}");
                    }
                    Err(GridError::NotANeighbor { rank }) => {
                        assert_eq!(rank, owner.get());
                        assert!(
                            owner == me || !grid.neighbor_ranks().contains(&owner),
                            "{strategy:?}: neighbor {owner} not resolved"
                        );
                    }
                    Err(e) => panic!("{strategy:?}: unexpected error {e:?}"),
                }
            }
        });
    }
}

#[test]
fn out_of_box_positions_are_rejected() {
    let comm = std::sync::Arc::new(NoComm);
    let grid = make_pargrid(
        GridStrategy::Sfc,
        comm,
        [4.0, 4.0, 4.0],
        1.0,
        ExtraParams::default(),
    )
    .unwrap();

    for p in [
        [-0.5, 1.0, 1.0],
        [4.5, 1.0, 1.0],
        [1.0, -1.0, 1.0],
        [1.0, 1.0, 7.0],
    ] {
        assert!(matches!(
            grid.position_to_rank(p),
            Err(GridError::OutOfBox { .. })
        ));
        assert!(matches!(
            grid.position_to_cell_index(p),
            Err(GridError::OutOfBox { .. })
        ));
    }
}
