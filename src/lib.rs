//! # pargrid
//!
//! pargrid is a library of parallel domain-decomposition schemes for regular
//! linked-cell grids, as used by particle-simulation codes on
//! distributed-memory clusters. A fixed cubic box with periodic boundaries
//! is split into uniform cells; each rank owns a subset of *local* cells and
//! caches a one-cell-thick *ghost layer* of neighboring cells owned by other
//! ranks. All partitioning strategies expose the same operation set and
//! support dynamic load balancing through [`repartition`] with a
//! user-supplied per-cell weight metric.
//!
//! ## Strategies
//! - `Cart`: static Cartesian tiling (baseline, never rebalances)
//! - `Graph`: native balanced graph growing, full repartition per call
//! - `Diffusion`: iterative neighbor-pair load transfer, one round per call
//! - `GridBased`: octagon subdomains over movable process-grid corners
//! - `KdTree`: recursive weight-balanced spatial bisection
//! - `Sfc`: Morton-ordered space-filling-curve intervals
//! - `Hybrid`: runtime switcher between `Graph` and `Diffusion`
//!
//! ## Usage
//! ```
//! use std::sync::Arc;
//! use pargrid::prelude::*;
//!
//! let comm = Arc::new(NoComm);
//! let mut grid = make_pargrid(
//!     GridStrategy::Cart,
//!     comm,
//!     [1.0, 1.0, 1.0],
//!     0.1,
//!     ExtraParams::default(),
//! )
//! .unwrap();
//! assert_eq!(grid.grid_size(), [10, 10, 10]);
//! assert_eq!(grid.n_local_cells(), 1000);
//!
//! let n = grid.n_local_cells() as usize;
//! let changed = grid
//!     .repartition(&move || vec![1.0; n], &mut || {})
//!     .unwrap();
//! assert!(!changed);
//! ```
//!
//! The transport is abstracted behind [`comm::Communicator`]; `NoComm`
//! serves single-rank use, `ThreadComm` maps ranks to threads for testing,
//! and an MPI backend is available behind the `mpi-support` feature.
//!
//! [`repartition`]: grids::ParallelLcGrid::repartition

pub mod check;
pub mod comm;
pub mod error;
pub mod exchange;
pub mod gbox;
pub mod grids;
pub mod index;
pub mod octagon;
pub mod wire;

/// The most-used types and functions in one import.
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{CommTag, Communicator, NoComm, ThreadComm, Wait};
    pub use crate::error::{GridError, Result};
    pub use crate::exchange::GhostExchangeDesc;
    pub use crate::gbox::GlobalBox;
    pub use crate::grids::{
        make_pargrid, ExtraParams, GridStrategy, InitialPartitioning, ParallelLcGrid,
    };
    pub use crate::index::{CellIndex, FullShellIdx, GhostCell, GlobalCell, LocalCell, Rank};
    pub use crate::octagon::{Octagon, Precision};
}
