//! `GridError`: unified error type for the public grid APIs.
//!
//! Failures are reported structurally, not as strings. `repartition` returns
//! `Ok(false)` for benign no-change or a recoverable abort; hard
//! post-condition violations surface as dedicated variants.

use thiserror::Error;

/// Unified error type for parallel grid operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    /// A position lies outside the simulation box (beyond round-off tolerance).
    #[error("position {pos:?} outside the simulation box")]
    OutOfBox {
        /// The offending position.
        pos: [f64; 3],
    },
    /// A position is not inside this rank's subdomain (or its ghost layer,
    /// where the query is defined on the ghost layer).
    #[error("position {pos:?} not in the local subdomain")]
    NotLocal {
        /// The offending position.
        pos: [f64; 3],
    },
    /// A local cell index was outside `[0, n_local_cells)`.
    #[error("cell index {index} out of range (n_local_cells = {n_local})")]
    CellIndexOutOfRange {
        /// The offending index.
        index: u32,
        /// Number of local cells at the time of the call.
        n_local: u32,
    },
    /// A command string could not be interpreted by the partitioner.
    #[error("could not interpret command `{0}`")]
    UnknownCommand(String),
    /// A command was understood but its argument is outside the valid range.
    #[error("invalid argument for command `{command}`: {argument}")]
    InvalidCommandArgument {
        /// The command that rejected its argument.
        command: &'static str,
        /// The rejected argument text.
        argument: String,
    },
    /// A repartitioning step left at least one rank without local cells.
    #[error("rank {rank} owns no cells after repartitioning")]
    PartitionEmpty {
        /// The rank left empty.
        rank: u32,
    },
    /// A repartitioning round produced a degenerate subdomain. The round is
    /// rolled back; the grid stays usable.
    #[error("repartitioning produced a degenerate octagon subdomain")]
    InvalidOctagon,
    /// Octagon validity was queried but no interaction cutoff was supplied at
    /// construction time.
    #[error("octagon was constructed without a cutoff; validity is undefined")]
    MissingCutoff,
    /// A rank was expected to be a neighbor of this process but is not.
    #[error("rank {rank} is not a neighbor of this process")]
    NotANeighbor {
        /// The rank in question.
        rank: u32,
    },
    /// The requested number of ranks cannot be served by this grid.
    #[error("grid of {n_cells} cells cannot be split over {n_ranks} ranks")]
    TooManyRanks {
        /// Total number of grid cells.
        n_cells: u64,
        /// Communicator size.
        n_ranks: u32,
    },
    /// A point-to-point or collective exchange failed.
    #[error("communication with rank {peer} failed: {reason}")]
    Comm {
        /// Peer rank of the failing exchange.
        peer: u32,
        /// Short description of the failure.
        reason: String,
    },
    /// Grid geometry parameters are unusable (non-positive box or cell size).
    #[error("invalid grid geometry: {0}")]
    InvalidGeometry(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GridError>;
