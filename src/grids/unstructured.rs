//! Shared state of the unstructured, partition-vector based strategies.
//!
//! Diffusion and graph balancing both materialize the partition as an array
//! of length `n_cells` mapping global cell index to owner. Every rank holds
//! a full copy, but only entries within one cell of its own subdomain are
//! kept authoritative; everything further out may be unknown and is garbage
//! collected on rebuild. All derived structures (local cell list, ghost
//! layer, border cells, exchange descriptors) are recomputed from the vector
//! after each round.

use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::{GridError, Result};
use crate::exchange::{build_subdomain, GhostExchangeDesc, Subdomain};
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};

use super::{dims_for_grid, InitialPartitioning};

pub(crate) struct VectorPartition<C: Communicator> {
    pub comm: Arc<C>,
    pub gbox: GlobalBox,
    /// Owner per global cell; `None` where this rank does not need to know.
    pub partition: Vec<Option<Rank>>,
    pub sub: Subdomain,
}

impl<C: Communicator> VectorPartition<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox, init: InitialPartitioning) -> Result<Self> {
        let n_cells = gbox.n_cells();
        let nprocs = comm.size() as u64;
        if n_cells < nprocs {
            return Err(GridError::TooManyRanks {
                n_cells,
                n_ranks: comm.size() as u32,
            });
        }

        let partition = initial_partition(&gbox, comm.size() as u32, init)?;
        let mut vp = VectorPartition {
            comm,
            gbox,
            partition,
            sub: Subdomain::default(),
        };
        vp.rebuild()?;
        Ok(vp)
    }

    #[inline]
    pub fn my_rank(&self) -> Rank {
        Rank::from_usize(self.comm.rank())
    }

    /// Global indices of the cells this rank currently owns, ascending.
    pub fn local_cells(&self) -> Vec<GlobalCell> {
        let me = Some(self.my_rank());
        (0..self.partition.len() as u64)
            .map(GlobalCell::new)
            .filter(|c| self.partition[c.get() as usize] == me)
            .collect()
    }

    /// Forgets ownership of every cell whose full shell does not touch this
    /// rank's subdomain.
    pub fn clear_far_ownership(&mut self) {
        let me = Some(self.my_rank());
        for idx in 0..self.partition.len() {
            let c = GlobalCell::new(idx as u64);
            if self.partition[idx] == me || self.partition[idx].is_none() {
                continue;
            }
            let near = self
                .gbox
                .full_shell(c)
                .iter()
                .any(|&n| self.partition[n.get() as usize] == me);
            if !near {
                self.partition[idx] = None;
            }
        }
    }

    /// Rederives all local structures from the partition vector.
    pub fn rebuild(&mut self) -> Result<()> {
        self.clear_far_ownership();
        let locals = self.local_cells();
        if locals.is_empty() {
            return Err(GridError::PartitionEmpty {
                rank: self.my_rank().get(),
            });
        }
        let gbox = &self.gbox;
        let partition = &self.partition;
        self.sub = build_subdomain(
            self.my_rank(),
            locals,
            |c| gbox.shell(c),
            |c| partition[c.get() as usize],
        )?;
        Ok(())
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

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.sub.exchange
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

    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        let cell = self.gbox.cell_at(pos)?;
        self.partition[cell.get() as usize].ok_or(GridError::NotLocal { pos })
    }

    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        let cell = self.gbox.cell_at(pos)?;
        match self.sub.global_to_local.get(&cell) {
            Some(CellIndex::Local(l)) => Ok(*l),
            _ => Err(GridError::NotLocal { pos }),
        }
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
}

fn initial_partition(
    gbox: &GlobalBox,
    nprocs: u32,
    init: InitialPartitioning,
) -> Result<Vec<Option<Rank>>> {
    let n = gbox.n_cells();
    let grid = gbox.grid_size();
    let owner_of: Box<dyn Fn(u64) -> u32> = match init {
        InitialPartitioning::Linear => Box::new(move |i| (i * nprocs as u64 / n) as u32),
        InitialPartitioning::Cart1d => {
            let axis = (0..3).max_by_key(|&d| grid[d]).unwrap();
            let extent = grid[axis] as u64;
            if extent < nprocs as u64 {
                return Err(GridError::TooManyRanks {
                    n_cells: n,
                    n_ranks: nprocs,
                });
            }
            let gbox = gbox.clone();
            Box::new(move |i| {
                let coord = gbox.unlinearize(GlobalCell::new(i))[axis] as u64;
                (coord * nprocs as u64 / extent) as u32
            })
        }
        InitialPartitioning::Cart3d => {
            let dims = dims_for_grid(nprocs, grid);
            if (0..3).any(|d| grid[d] < dims[d]) {
                return Err(GridError::TooManyRanks {
                    n_cells: n,
                    n_ranks: nprocs,
                });
            }
            let gbox = gbox.clone();
            Box::new(move |i| {
                let c = gbox.unlinearize(GlobalCell::new(i));
                let mut p = [0u32; 3];
                for d in 0..3 {
                    p[d] = (c[d] as u64 * dims[d] as u64 / grid[d] as u64) as u32;
                }
                p[0] + dims[0] * (p[1] + dims[1] * p[2])
            })
        }
    };
    Ok((0..n).map(|i| Some(Rank::new(owner_of(i)))).collect())
}
