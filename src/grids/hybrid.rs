//! Switcher between graph and diffusion balancing.
//!
//! Both underlying strategies maintain the same partition-vector state, so
//! switching hands the current vector to the newly active implementation and
//! rebuilds its local structures. `command("toggle")` arms a switch that is
//! executed at the start of the next repartitioning call.

use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::{GridError, Result};
use crate::exchange::GhostExchangeDesc;
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};

use super::diffusion::DiffusionGrid;
use super::graph::GraphGrid;
use super::{InitialPartitioning, Metric, StartCallback};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Active {
    Diffusion,
    Graph,
}

/// Grid switching between diffusive and graph-based balancing.
pub struct HybridGrid<C: Communicator> {
    diffusion: DiffusionGrid<C>,
    graph: GraphGrid<C>,
    active: Active,
    switch_to: Active,
}

macro_rules! active {
    ($self:expr, $g:ident => $body:expr) => {
        match $self.active {
            Active::Diffusion => {
                let $g = &$self.diffusion;
                $body
            }
            Active::Graph => {
                let $g = &$self.graph;
                $body
            }
        }
    };
}

impl<C: Communicator> HybridGrid<C> {
    pub fn new(comm: Arc<C>, gbox: GlobalBox, init: InitialPartitioning) -> Result<Self> {
        Ok(HybridGrid {
            diffusion: DiffusionGrid::new(comm.clone(), gbox.clone(), init)?,
            graph: GraphGrid::new(comm, gbox, init)?,
            active: Active::Diffusion,
            switch_to: Active::Diffusion,
        })
    }

    pub fn n_local_cells(&self) -> u32 {
        active!(self, g => g.n_local_cells())
    }

    pub fn n_ghost_cells(&self) -> u32 {
        active!(self, g => g.n_ghost_cells())
    }

    pub fn cell_size(&self) -> [f64; 3] {
        active!(self, g => g.cell_size())
    }

    pub fn grid_size(&self) -> [u32; 3] {
        active!(self, g => g.grid_size())
    }

    pub fn neighbor_ranks(&self) -> &[Rank] {
        active!(self, g => g.neighbor_ranks())
    }

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        active!(self, g => g.cell_neighbor_index(cell, k))
    }

    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        active!(self, g => g.get_boundary_info())
    }

    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        active!(self, g => g.position_to_cell_index(pos))
    }

    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        active!(self, g => g.position_to_rank(pos))
    }

    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        active!(self, g => g.position_to_neighidx(pos))
    }

    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        active!(self, g => g.global_hash(idx))
    }

    /// Repartitions with the active implementation, switching first if a
    /// toggle is pending.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        if self.switch_to != self.active {
            self.switch_implementation()?;
        }
        match self.active {
            Active::Diffusion => self.diffusion.repartition(metric, start),
            Active::Graph => self.graph.repartition(metric, start),
        }
    }

    /// `toggle` arms a switch to the other implementation.
    pub fn command(&mut self, cmd: &str) -> Result<()> {
        match cmd.trim() {
            "toggle" => {
                self.switch_to = match self.active {
                    Active::Diffusion => Active::Graph,
                    Active::Graph => Active::Diffusion,
                };
                Ok(())
            }
            _ => Err(GridError::UnknownCommand(cmd.to_owned())),
        }
    }

    /// Copies the partition vector into the newly active implementation and
    /// rebuilds it. Ownership itself does not change, so previously handed
    /// out indices stay valid.
    fn switch_implementation(&mut self) -> Result<()> {
        match self.switch_to {
            Active::Graph => {
                let part = self.diffusion.partition_mut().partition.clone();
                self.graph.partition_mut().partition = part;
                self.graph.partition_mut().rebuild()?;
            }
            Active::Diffusion => {
                let part = self.graph.partition_mut().partition.clone();
                self.diffusion.partition_mut().partition = part;
                self.diffusion.partition_mut().rebuild()?;
            }
        }
        self.active = self.switch_to;
        Ok(())
    }
}
