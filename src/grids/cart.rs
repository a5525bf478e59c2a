//! Static Cartesian tiling.
//!
//! The process count is factorized into a balanced 3d process grid; every
//! rank owns the block of cells of its grid coordinate. Ownership is a pure
//! function of the cell coordinate, so `position_to_rank` works box-wide and
//! `repartition` is a no-op.

use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::{GridError, Result};
use crate::exchange::{build_subdomain, GhostExchangeDesc, Subdomain};
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};

use super::{dims_for_grid, Metric, StartCallback};

/// Grid with a fixed Cartesian decomposition.
pub struct CartGrid<C: Communicator> {
    gbox: GlobalBox,
    dims: [u32; 3],
    sub: Subdomain,
    _comm: std::marker::PhantomData<C>,
}

impl<C: Communicator> CartGrid<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox) -> Result<Self> {
        let nprocs = comm.size() as u32;
        let grid = gbox.grid_size();
        let dims = dims_for_grid(nprocs, grid);
        if (0..3).any(|d| grid[d] < dims[d]) {
            return Err(GridError::TooManyRanks {
                n_cells: gbox.n_cells(),
                n_ranks: nprocs,
            });
        }

        let me = Rank::from_usize(comm.rank());
        let locals: Vec<GlobalCell> = (0..gbox.n_cells())
            .map(GlobalCell::new)
            .filter(|&c| owner_of(&gbox, dims, c) == me)
            .collect();
        let sub = build_subdomain(
            me,
            locals,
            |c| gbox.shell(c),
            |c| Some(owner_of(&gbox, dims, c)),
        )?;

        Ok(CartGrid {
            gbox,
            dims,
            sub,
            _comm: std::marker::PhantomData,
        })
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

    pub fn neighbor_ranks(&self) -> &[Rank] {
        &self.sub.neighbors
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

    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        let cell = self.gbox.cell_at(pos)?;
        Ok(owner_of(&self.gbox, self.dims, cell))
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.sub
            .neighbors
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

    /// The Cartesian decomposition never moves.
    pub fn repartition(&mut self, _metric: Metric, _start: StartCallback) -> Result<bool> {
        Ok(false)
    }
}

fn owner_of(gbox: &GlobalBox, dims: [u32; 3], cell: GlobalCell) -> Rank {
    let c = gbox.unlinearize(cell);
    let grid = gbox.grid_size();
    let mut p = [0u32; 3];
    for d in 0..3 {
        p[d] = (c[d] as u64 * dims[d] as u64 / grid[d] as u64) as u32;
    }
    Rank::new(p[0] + dims[0] * (p[1] + dims[1] * p[2]))
}
