//! MeshAdaptError: unified error type for mesh-adapt public APIs.
//!
//! Recoverable conditions (an infeasible collapse, a degenerate metric, the
//! outer-iteration cap) are handled inside the adaptation loops and surface
//! only as `tracing` diagnostics. The variants below are precondition
//! violations: they indicate programmer error in the driver or in the halo
//! protocol and terminate the operation that detected them.

use thiserror::Error;

/// Unified error type for mesh-adapt operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshAdaptError {
    /// A halo message referenced a global vertex number this rank has never
    /// been told about.
    #[error("halo decode references unknown global vertex {0}")]
    UnknownGlobalVertex(usize),
    /// The collapse kernel was invoked on a vertex whose identification did
    /// not certify a target.
    #[error("vertex {0} scheduled for collapse without a certified target")]
    UncertifiedCollapse(usize),
    /// The colouring stage left a scheduled vertex without a colour.
    #[error("colouring produced no colour for scheduled vertex {0}")]
    UncolouredVertex(usize),
    /// A halo message ended mid-record.
    #[error("truncated halo message from rank {0}")]
    TruncatedHaloMessage(usize),
    /// Two local vertices carry the same global number.
    #[error("global numbering is not injective: {0} appears twice")]
    DuplicateGlobalNumber(usize),
    /// An adjacency invariant does not hold (NNList symmetry, NEList
    /// membership, edge/element incidence).
    #[error("adjacency invariant broken: {0}")]
    BrokenAdjacency(String),
    /// Geometric input the kernels cannot operate on (inverted or degenerate
    /// element outside the guarded paths).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}
