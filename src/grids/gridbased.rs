//! Grid-based balancing with octagon subdomains.
//!
//! The box is tiled by `nprocs` octagons whose corner vertices form a
//! movable 3d grid of points, initially the corners of a Cartesian
//! subdivision. Every rank owns the octagon whose upper corner is its
//! process-grid point and keeps a fixed set of up to 26 process-grid
//! neighbors for its whole lifetime. A repartitioning round shifts each
//! grid point a fraction `mu` toward the rank's center of load, gathers the
//! shifted points, and accepts the round only if every candidate octagon in
//! the neighborhood stays valid; otherwise the round rolls back and reports
//! no change.

use std::collections::HashMap;
use std::sync::Arc;

use crate::comm::collectives::{all_gather_pod, all_reduce_and};
use crate::comm::{Communicator, REPART_TAGS};
use crate::ensure;
use crate::error::{GridError, Result};
use crate::exchange::{build_subdomain, GhostExchangeDesc, Subdomain};
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};
use crate::octagon::{Octagon, Precision};

use super::{Metric, MidpointFn, StartCallback};

/// Grid with movable octagon subdomains.
pub struct GridBasedGrid<C: Communicator> {
    comm: Arc<C>,
    gbox: GlobalBox,
    max_cutoff: f64,
    precision: Precision,
    dims: [u32; 3],
    mu: f64,
    /// Position-to-rank queries can be answered box-wide while the point
    /// grid is still the initial regular subdivision.
    is_regular: bool,
    /// One grid point per rank: the upper corner of its subdomain.
    gridpoints: Vec<[f64; 3]>,
    my_dom: Octagon,
    /// Octagons of the process-grid neighbors, parallel to `neighbors`.
    neighbor_doms: Vec<Octagon>,
    /// Fixed process-grid neighborhood, ascending, never changes.
    neighbors: Vec<Rank>,
    midpoint: Option<Arc<MidpointFn>>,
    sub: Subdomain,
}

impl<C: Communicator> GridBasedGrid<C> {
    pub fn new(
        comm: Arc<C>,
        gbox: GlobalBox,
        max_cutoff: f64,
        midpoint: Option<Arc<MidpointFn>>,
    ) -> Result<Self> {
        let nprocs = comm.size() as u32;
        let grid = gbox.grid_size();
        let dims = super::dims_for_grid(nprocs, grid);
        if (0..3).any(|d| grid[d] < dims[d]) {
            return Err(GridError::TooManyRanks {
                n_cells: gbox.n_cells(),
                n_ranks: nprocs,
            });
        }
        let me = comm.rank() as u32;
        let coords = coords_of(me, dims);
        let precision = Precision::for_box(max_cutoff, gbox.box_size());

        let gridpoints: Vec<[f64; 3]> = (0..nprocs)
            .map(|r| {
                let c = coords_of(r, dims);
                let l = gbox.box_size();
                [
                    (c[0] + 1) as f64 / dims[0] as f64 * l[0],
                    (c[1] + 1) as f64 / dims[1] as f64 * l[1],
                    (c[2] + 1) as f64 / dims[2] as f64 * l[2],
                ]
            })
            .collect();

        let neighbors = proc_neighbors(coords, dims);

        let mut grid_obj = GridBasedGrid {
            comm,
            gbox,
            max_cutoff,
            precision,
            dims,
            mu: 0.1,
            is_regular: true,
            gridpoints,
            my_dom: Octagon::from_grid_points([[0; 3]; 8], precision),
            neighbor_doms: Vec::new(),
            neighbors,
            midpoint,
            sub: Subdomain::default(),
        };
        let (my_dom, neighbor_doms) = grid_obj.build_octagons(&grid_obj.gridpoints);
        // The initial regular tiling must already respect the cutoff;
        // otherwise no amount of shifting can produce usable subdomains.
        let mut ok = my_dom.is_valid()?;
        for dom in &neighbor_doms {
            ok = ok && dom.is_valid()?;
        }
        if !ok {
            return Err(GridError::InvalidOctagon);
        }
        grid_obj.my_dom = my_dom;
        grid_obj.neighbor_doms = neighbor_doms;
        grid_obj.rebuild()?;
        Ok(grid_obj)
    }

    pub fn n_local_cells(&self) -> u32 {
        self.sub.n_local
    }

    pub fn n_ghost_cells(&self) -> u32 {
        self.sub.n_ghost
    }

    pub fn cell_size(&self) -> [f64; 3] {
        self.gbox.cell_size()
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.gbox.grid_size()
    }

    /// The constant process-grid neighborhood.
    pub fn neighbor_ranks(&self) -> &[Rank] {
        &self.neighbors
    }

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        if cell.get() >= self.sub.n_local {
            return Err(GridError::CellIndexOutOfRange {
                index: cell.get(),
                n_local: self.sub.n_local,
            });
        }
        let global = self.gbox.neighbor(self.sub.cells[cell.as_usize()], k);
        match self.sub.global_to_local.get(&global) {
            Some(&idx) => Ok(idx),
            None => crate::ensure_not_reached!("shell cell {global} missing from the ghost layer"),
        }
    }

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.sub.exchange
    }

    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        let cell = self.gbox.cell_at(pos)?;
        match self.sub.global_to_local.get(&cell) {
            Some(CellIndex::Local(l)) => Ok(*l),
            _ => Err(GridError::NotLocal { pos }),
        }
    }

    /// Box-wide while the grid is still regular; afterwards only defined for
    /// positions in the own subdomain and its ghost layer.
    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        let cell = self.gbox.cell_at(pos)?; // also the box membership check
        if self.is_regular {
            return Ok(regular_owner(&self.gbox, self.dims, cell));
        }
        let l = self.gbox.box_size();
        if self.my_dom.contains_wrapped(pos, l) {
            return Ok(Rank::from_usize(self.comm.rank()));
        }
        for (dom, &rank) in self.neighbor_doms.iter().zip(&self.neighbors) {
            if dom.contains_wrapped(pos, l) {
                return Ok(rank);
            }
        }
        Err(GridError::NotLocal { pos })
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.neighbors
            .iter()
            .position(|&r| r == rank)
            .ok_or(GridError::NotANeighbor { rank: rank.get() })
    }

    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        let at = idx.storage_index(self.sub.n_local);
        if at >= self.sub.cells.len() {
            return Err(GridError::CellIndexOutOfRange {
                index: at as u32,
                n_local: self.sub.n_local,
            });
        }
        Ok(self.sub.cells[at])
    }

    /// `set mu <x>` with `x` in `(0, 0.5]`.
    pub fn command(&mut self, cmd: &str) -> Result<()> {
        let rest = cmd
            .trim()
            .strip_prefix("set mu ")
            .ok_or_else(|| GridError::UnknownCommand(cmd.to_owned()))?;
        let value: f64 = rest
            .trim()
            .parse()
            .map_err(|_| GridError::UnknownCommand(cmd.to_owned()))?;
        if !(value > 0.0 && value <= 0.5) {
            return Err(GridError::InvalidCommandArgument {
                command: "set mu",
                argument: rest.trim().to_owned(),
            });
        }
        self.mu = value;
        Ok(())
    }

    /// One grid-point shift round. Collective on the communicator.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        let weights = metric();
        ensure!(
            weights.len() == self.sub.n_local as usize,
            "metric returned {} weights for {} local cells",
            weights.len(),
            self.sub.n_local
        );

        // Shift the own grid point toward the center of load.
        let locals = &self.sub.cells[..self.sub.n_local as usize];
        let me = self.comm.rank();
        let own_point = self.gridpoints[me];
        let center = match &self.midpoint {
            Some(hook) => hook(&self.gbox, locals, &weights),
            None => self.center_of_load(locals, &weights, own_point),
        };
        let shifted = [
            own_point[0] + self.mu * (center[0] - own_point[0]),
            own_point[1] + self.mu * (center[1] - own_point[1]),
            own_point[2] + self.mu * (center[2] - own_point[2]),
        ];

        let candidate_points = all_gather_pod(self.comm.as_ref(), REPART_TAGS.gather, &shifted);

        // Build and validate the candidate octagons of the neighborhood.
        let (my_dom, neighbor_doms) = self.build_octagons(&candidate_points);
        let mut ok = my_dom.is_valid()?;
        for dom in &neighbor_doms {
            ok = ok && dom.is_valid()?;
        }
        if !all_reduce_and(self.comm.as_ref(), REPART_TAGS.gather.offset(2), ok) {
            return Ok(false); // roll back this round
        }

        self.gridpoints = candidate_points;
        self.my_dom = my_dom;
        self.neighbor_doms = neighbor_doms;
        self.is_regular = false;

        let new_locals = self.owned_cells();
        let unchanged = new_locals == self.sub.cells[..self.sub.n_local as usize];
        if all_reduce_and(
            self.comm.as_ref(),
            REPART_TAGS.gather.offset(3),
            unchanged,
        ) {
            return Ok(false);
        }

        if new_locals.is_empty() {
            return Err(GridError::PartitionEmpty {
                rank: self.comm.rank() as u32,
            });
        }

        start();
        self.rebuild()?;
        Ok(true)
    }

    /// Weighted centroid of the local cell centers, unwrapped into the
    /// subdomain frame below the own grid point. Falls back to the grid
    /// point itself when the subdomain carries no weight.
    fn center_of_load(&self, locals: &[GlobalCell], weights: &[f64], own_point: [f64; 3]) -> [f64; 3] {
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return own_point;
        }
        let l = self.gbox.box_size();
        let mut acc = [0.0f64; 3];
        for (&cell, &w) in locals.iter().zip(weights) {
            let mut center = self.gbox.cell_center(cell);
            for d in 0..3 {
                if center[d] > own_point[d] {
                    center[d] -= l[d];
                }
            }
            for d in 0..3 {
                acc[d] += w * center[d];
            }
        }
        [acc[0] / total, acc[1] / total, acc[2] / total]
    }

    /// The octagons of this rank and its process-grid neighbors for a given
    /// set of grid points.
    fn build_octagons(&self, points: &[[f64; 3]]) -> (Octagon, Vec<Octagon>) {
        let my_dom = self.octagon_of(points, Rank::from_usize(self.comm.rank()));
        let neighbor_doms = self
            .neighbors
            .iter()
            .map(|&r| self.octagon_of(points, r))
            .collect();
        (my_dom, neighbor_doms)
    }

    /// Vertex `i` of rank `r`'s octagon is the grid point of the process one
    /// step below `r` along each axis with a set bit in `i`, mirrored across
    /// the periodic boundary where the step wraps.
    fn octagon_of(&self, points: &[[f64; 3]], r: Rank) -> Octagon {
        let c = coords_of(r.get(), self.dims);
        let l = self.gbox.box_size();
        let mut pts = [[0i64; 3]; 8];
        for (i, pt) in pts.iter_mut().enumerate() {
            let mut src = [0u32; 3];
            let mut mirror = [0i64; 3];
            for d in 0..3 {
                let step = ((i >> d) & 1) as i64;
                let q = c[d] as i64 - step;
                if q < 0 {
                    src[d] = (q + self.dims[d] as i64) as u32;
                    mirror[d] = -1;
                } else {
                    src[d] = q as u32;
                }
            }
            let source_rank = rank_of(src, self.dims) as usize;
            let gp = self.precision.discretize(points[source_rank]);
            for d in 0..3 {
                pt[d] = gp[d] + mirror[d] * self.precision.span(l[d]);
            }
        }
        Octagon::from_grid_points_with_cutoff(pts, self.precision, self.max_cutoff)
    }

    /// Cells whose centers fall into the own octagon, ascending.
    fn owned_cells(&self) -> Vec<GlobalCell> {
        let l = self.gbox.box_size();
        (0..self.gbox.n_cells())
            .map(GlobalCell::new)
            .filter(|&c| self.my_dom.contains_wrapped(self.gbox.cell_center(c), l))
            .collect()
    }

    /// Rebuilds the subdomain from octagon containment of cell centers.
    fn rebuild(&mut self) -> Result<()> {
        let locals = self.owned_cells();
        if locals.is_empty() {
            return Err(GridError::PartitionEmpty {
                rank: self.comm.rank() as u32,
            });
        }

        // Resolve ownership once per cell in the one-ring around the
        // subdomain instead of scanning octagons per query.
        let l = self.gbox.box_size();
        let me = Rank::from_usize(self.comm.rank());
        let mut owners: HashMap<GlobalCell, Rank> =
            locals.iter().map(|&c| (c, me)).collect();
        for &c in &locals {
            for n in self.gbox.shell(c) {
                if owners.contains_key(&n) {
                    continue;
                }
                let center = self.gbox.cell_center(n);
                let owner = self
                    .neighbor_doms
                    .iter()
                    .zip(&self.neighbors)
                    .find(|(dom, _)| dom.contains_wrapped(center, l))
                    .map(|(_, &r)| r);
                if let Some(owner) = owner {
                    owners.insert(n, owner);
                }
            }
        }

        self.sub = build_subdomain(
            me,
            locals,
            |c| self.gbox.shell(c),
            |c| owners.get(&c).copied(),
        )?;
        Ok(())
    }
}

fn coords_of(rank: u32, dims: [u32; 3]) -> [u32; 3] {
    [
        rank % dims[0],
        rank / dims[0] % dims[1],
        rank / (dims[0] * dims[1]),
    ]
}

fn rank_of(coords: [u32; 3], dims: [u32; 3]) -> u32 {
    coords[0] + dims[0] * (coords[1] + dims[1] * coords[2])
}

/// Owner under the initial regular subdivision.
fn regular_owner(gbox: &GlobalBox, dims: [u32; 3], cell: GlobalCell) -> Rank {
    let c = gbox.unlinearize(cell);
    let grid = gbox.grid_size();
    let mut p = [0u32; 3];
    for d in 0..3 {
        p[d] = (c[d] as u64 * dims[d] as u64 / grid[d] as u64) as u32;
    }
    Rank::new(rank_of(p, dims))
}

/// The distinct ranks at the 26 surrounding process-grid coordinates.
fn proc_neighbors(coords: [u32; 3], dims: [u32; 3]) -> Vec<Rank> {
    let mut out = Vec::new();
    let me = rank_of(coords, dims);
    for dz in -1i64..=1 {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 && dz == 0 {
                    continue;
                }
                let q = [
                    (coords[0] as i64 + dx).rem_euclid(dims[0] as i64) as u32,
                    (coords[1] as i64 + dy).rem_euclid(dims[1] as i64) as u32,
                    (coords[2] as i64 + dz).rem_euclid(dims[2] as i64) as u32,
                ];
                let r = rank_of(q, dims);
                if r != me && !out.contains(&Rank::new(r)) {
                    out.push(Rank::new(r));
                }
            }
        }
    }
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_neighbors_are_symmetric_and_unique() {
        let dims = [2, 2, 2];
        for r in 0..8u32 {
            let n = proc_neighbors(coords_of(r, dims), dims);
            // 2x2x2 with periodic wrap: everyone neighbors everyone else.
            assert_eq!(n.len(), 7);
            for other in &n {
                let back = proc_neighbors(coords_of(other.get(), dims), dims);
                assert!(back.contains(&Rank::new(r)));
            }
        }
    }

    #[test]
    fn coords_roundtrip() {
        let dims = [3, 2, 2];
        for r in 0..12u32 {
            assert_eq!(rank_of(coords_of(r, dims), dims), r);
        }
    }
}
