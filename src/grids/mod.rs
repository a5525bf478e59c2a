//! The parallel linked-cell grid abstraction and its strategies.
//!
//! Every strategy realizes the same operation set over the shared data
//! model: local cells first, ghost cells after, the canonical 27-slot
//! neighborhood, per-peer ghost exchange descriptors. Strategies are
//! dispatched through a tagged sum, [`ParallelLcGrid`]; there is no trait
//! object in the hot path and the variant set is closed.

use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::{GridError, Result};
use crate::exchange::GhostExchangeDesc;
use crate::gbox::GlobalBox;
use crate::index::{CellIndex, FullShellIdx, GlobalCell, LocalCell, Rank};

pub mod cart;
pub mod diffusion;
pub mod graph;
pub mod gridbased;
pub mod hybrid;
pub mod kdtree;
pub mod sfc;
pub(crate) mod unstructured;

pub use cart::CartGrid;
pub use diffusion::DiffusionGrid;
pub use graph::GraphGrid;
pub use gridbased::GridBasedGrid;
pub use hybrid::HybridGrid;
pub use kdtree::KdTreeGrid;
pub use sfc::SfcGrid;

/// User-supplied per-cell weight callback.
///
/// Must return one non-negative weight per local cell, in local cell order.
/// Weights are additive estimates of per-cell work.
pub type Metric<'a> = &'a dyn Fn() -> Vec<f64>;

/// Callback invoked once ownership is updated but before local data
/// structures are rebuilt; `position_to_rank` is already valid, so the
/// caller can start migrating its payload data.
pub type StartCallback<'a> = &'a mut dyn FnMut();

/// Hook computing the load midpoint of a subdomain for the grid-based
/// strategy. Receives the box geometry, the local cells and their weights.
pub type MidpointFn = dyn Fn(&GlobalBox, &[GlobalCell], &[f64]) -> [f64; 3] + Send + Sync;

/// Available partitioning strategies.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GridStrategy {
    /// Static Cartesian tiling; never repartitions.
    Cart,
    /// Native balanced graph growing over the cell graph; full repartition.
    Graph,
    /// Iterative neighbor-pair load transfer; one round per call.
    Diffusion,
    /// Octagon subdomains over movable process-grid corner points.
    GridBased,
    /// Recursive weight-balanced spatial bisection.
    KdTree,
    /// Morton-ordered space-filling-curve intervals.
    Sfc,
    /// Switcher between [`GridStrategy::Graph`] and [`GridStrategy::Diffusion`].
    Hybrid,
}

/// Initial cell assignment for the unstructured strategies.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum InitialPartitioning {
    /// Balanced split along the row-major linearization.
    #[default]
    Linear,
    /// Slabs along the longest grid axis.
    Cart1d,
    /// Blocks of a balanced 3d process grid.
    Cart3d,
}

/// Optional construction parameters recognized by some strategies.
#[derive(Clone, Default)]
pub struct ExtraParams {
    /// Load midpoint hook for the grid-based strategy; defaults to the
    /// weighted centroid of cell centers.
    pub subdomain_midpoint: Option<Arc<MidpointFn>>,
    /// Initial partitioning for the unstructured strategies.
    pub init_part: Option<InitialPartitioning>,
}

/// A parallel linked-cell grid with one of the available strategies.
pub enum ParallelLcGrid<C: Communicator> {
    Cart(CartGrid<C>),
    Graph(GraphGrid<C>),
    Diffusion(DiffusionGrid<C>),
    GridBased(GridBasedGrid<C>),
    KdTree(KdTreeGrid<C>),
    Sfc(SfcGrid<C>),
    Hybrid(HybridGrid<C>),
}

/// Creates a grid over `comm` for a periodic box of extents `box_size`
/// partitioned into cells of at least `min_cell_size` per side.
pub fn make_pargrid<C: Communicator>(
    strategy: GridStrategy,
    comm: Arc<C>,
    box_size: [f64; 3],
    min_cell_size: f64,
    extra: ExtraParams,
) -> Result<ParallelLcGrid<C>> {
    let gbox = GlobalBox::new(box_size, min_cell_size)?;
    Ok(match strategy {
        GridStrategy::Cart => ParallelLcGrid::Cart(CartGrid::new(comm, gbox)?),
        GridStrategy::Graph => {
            ParallelLcGrid::Graph(GraphGrid::new(comm, gbox, extra.init_part.unwrap_or_default())?)
        }
        GridStrategy::Diffusion => ParallelLcGrid::Diffusion(DiffusionGrid::new(
            comm,
            gbox,
            extra.init_part.unwrap_or_default(),
        )?),
        GridStrategy::GridBased => ParallelLcGrid::GridBased(GridBasedGrid::new(
            comm,
            gbox,
            min_cell_size,
            extra.subdomain_midpoint,
        )?),
        GridStrategy::KdTree => ParallelLcGrid::KdTree(KdTreeGrid::new(comm, gbox)?),
        GridStrategy::Sfc => ParallelLcGrid::Sfc(SfcGrid::new(comm, gbox)?),
        GridStrategy::Hybrid => ParallelLcGrid::Hybrid(HybridGrid::new(
            comm,
            gbox,
            extra.init_part.unwrap_or_default(),
        )?),
    })
}

macro_rules! dispatch {
    ($self:expr, $g:ident => $body:expr) => {
        match $self {
            ParallelLcGrid::Cart($g) => $body,
            ParallelLcGrid::Graph($g) => $body,
            ParallelLcGrid::Diffusion($g) => $body,
            ParallelLcGrid::GridBased($g) => $body,
            ParallelLcGrid::KdTree($g) => $body,
            ParallelLcGrid::Sfc($g) => $body,
            ParallelLcGrid::Hybrid($g) => $body,
        }
    };
}

impl<C: Communicator> ParallelLcGrid<C> {
    /// Number of cells owned by this rank.
    pub fn n_local_cells(&self) -> u32 {
        dispatch!(self, g => g.n_local_cells())
    }

    /// Number of ghost cells cached on this rank.
    pub fn n_ghost_cells(&self) -> u32 {
        dispatch!(self, g => g.n_ghost_cells())
    }

    /// Edge lengths of one grid cell.
    pub fn cell_size(&self) -> [f64; 3] {
        dispatch!(self, g => g.cell_size())
    }

    /// Number of grid cells per axis.
    pub fn grid_size(&self) -> [u32; 3] {
        dispatch!(self, g => g.grid_size())
    }

    /// Ranks this rank exchanges ghost layers with; each appears once.
    pub fn neighbor_ranks(&self) -> &[Rank] {
        dispatch!(self, g => g.neighbor_ranks())
    }

    /// The `k`-th full-shell neighbor of local cell `cell`.
    ///
    /// Slot 0 is the cell itself, slots `1..14` the half shell, `14..27`
    /// the remainder.
    pub fn cell_neighbor_index(&self, cell: LocalCell, k: FullShellIdx) -> Result<CellIndex> {
        dispatch!(self, g => g.cell_neighbor_index(cell, k))
    }

    /// Ghost exchange descriptors, ascending peer rank.
    ///
    /// Borrowed views are invalidated by the next successful
    /// [`repartition`](Self::repartition).
    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        dispatch!(self, g => g.get_boundary_info())
    }

    /// Local cell containing `pos`; fails with
    /// [`GridError::NotLocal`] if this rank does not own it.
    pub fn position_to_cell_index(&self, pos: [f64; 3]) -> Result<LocalCell> {
        dispatch!(self, g => g.position_to_cell_index(pos))
    }

    /// Rank responsible for `pos`.
    pub fn position_to_rank(&self, pos: [f64; 3]) -> Result<Rank> {
        dispatch!(self, g => g.position_to_rank(pos))
    }

    /// Neighbor index of the rank responsible for `pos`; `pos` must lie in
    /// the ghost layer.
    pub fn position_to_neighidx(&self, pos: [f64; 3]) -> Result<usize> {
        dispatch!(self, g => g.position_to_neighidx(pos))
    }

    /// Strategy-stable global identity of a known cell; identical on every
    /// rank holding the cell, locally or as a ghost.
    pub fn global_hash(&self, idx: CellIndex) -> Result<GlobalCell> {
        dispatch!(self, g => g.global_hash(idx))
    }

    /// Possibly repartitions the grid; returns whether the partition
    /// changed. On `true`, all previously returned indices and descriptors
    /// are invalidated. `start` runs after ownership is updated but before
    /// local structures are rebuilt, while `position_to_rank` is valid.
    pub fn repartition(&mut self, metric: Metric, start: StartCallback) -> Result<bool> {
        dispatch!(self, g => g.repartition(metric, start))
    }

    /// Delivers an implementation-defined tuning command.
    pub fn command(&mut self, cmd: &str) -> Result<()> {
        match self {
            ParallelLcGrid::GridBased(g) => g.command(cmd),
            ParallelLcGrid::Hybrid(g) => g.command(cmd),
            _ => Err(GridError::UnknownCommand(cmd.to_owned())),
        }
    }
}

/// Balanced three-factor decomposition of a process count, non-increasing.
pub(crate) fn dims_create(nprocs: u32) -> [u32; 3] {
    let mut best = [nprocs, 1, 1];
    let mut best_spread = nprocs;
    for a in 1..=nprocs {
        if nprocs % a != 0 {
            continue;
        }
        let rest = nprocs / a;
        for b in 1..=rest {
            if rest % b != 0 {
                continue;
            }
            let c = rest / b;
            let mut dims = [a, b, c];
            dims.sort_unstable_by(|x, y| y.cmp(x));
            let spread = dims[0] - dims[2];
            if spread < best_spread {
                best_spread = spread;
                best = dims;
            }
        }
    }
    best
}

/// Assigns the factors of [`dims_create`] to grid axes, largest factor to
/// the axis with the most cells.
pub(crate) fn dims_for_grid(nprocs: u32, grid: [u32; 3]) -> [u32; 3] {
    let dims = dims_create(nprocs);
    let mut axes = [0usize, 1, 2];
    axes.sort_by_key(|&d| std::cmp::Reverse(grid[d]));
    let mut out = [1u32; 3];
    for (i, &axis) in axes.iter().enumerate() {
        out[axis] = dims[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_create_is_balanced() {
        assert_eq!(dims_create(1), [1, 1, 1]);
        assert_eq!(dims_create(8), [2, 2, 2]);
        assert_eq!(dims_create(12), [3, 2, 2]);
        assert_eq!(dims_create(7), [7, 1, 1]);
        assert_eq!(dims_create(64), [4, 4, 4]);
    }

    #[test]
    fn dims_follow_grid_shape() {
        assert_eq!(dims_for_grid(4, [8, 2, 2]), [2, 2, 1]);
        let d = dims_for_grid(12, [4, 8, 2]);
        assert_eq!(d[1], 3);
        assert_eq!(d[0] * d[1] * d[2], 12);
    }
}
