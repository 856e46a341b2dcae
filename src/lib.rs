//! # mesh-adapt
//!
//! mesh-adapt is the core of an anisotropic mesh adapter for unstructured
//! simplicial meshes (triangles in 2D, tetrahedra in 3D). It adapts a mesh
//! so that every edge length, measured in a user-supplied Riemannian metric
//! field, approaches unity. The crate provides the topology-changing
//! coarsening engine and the metric-space vertex smoother, together with the
//! surface-classification module both depend on, plus the supporting pieces
//! they need to run serial or distributed: a mesh container with explicit
//! adjacency, geometric element properties (Lipnikov quality and its
//! gradient), deterministic distance-2 graph colouring, and a communicator
//! trait with serial and in-process mailbox backends (an MPI binding is the
//! driver's collaborator and plugs into the same trait).
//!
//! ## Features
//! - Edge-collapse coarsening with surface, invertibility and edge-length
//!   guards, scheduled over colour-disjoint maximal independent sets
//! - Laplacian / smart-Laplacian / Linf-optimisation smoothing in metric
//!   space with active-vertex propagation
//! - Boundary facet classification into coplanar patches with corner and
//!   collapse-admissibility predicates
//! - Halo exchange of topology mutations and vertex data across ranks
//!
//! ## Usage
//! Add the dependency (the `rayon` feature is on by default):
//!
//! ```toml
//! [dependencies]
//! mesh-adapt = "0.1"
//! ```
//!
//! The driver owns the adaptation strategy; the two entry points are
//! [`coarsen::Coarsen::coarsen`] and [`smooth::Smooth::smooth`]:
//!
//! ```rust
//! use mesh_adapt::prelude::*;
//!
//! // Unit square split into four triangles around its centroid.
//! let coords = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5];
//! let tris = [0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
//! let mut mesh = Mesh::new_2d(&coords, &tris);
//! let mut surface = Surface::new(&mesh);
//! let comm = NoComm;
//!
//! Coarsen::new(&mut mesh, &mut surface, &comm).coarsen(0.8, 2.0)?;
//! Smooth::new(&mut mesh, &comm).smooth("optimisation Linf", 10, None)?;
//! # Ok::<(), mesh_adapt::mesh_error::MeshAdaptError>(())
//! ```

pub mod algs;
pub mod coarsen;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;
pub mod smooth;
pub mod surface;

/// A convenient prelude to import the most-used types:
pub mod prelude {
    pub use crate::algs::colour::colour_distance2;
    pub use crate::algs::communicator::{CommTag, Communicator, MailboxComm, NoComm, Wait};
    pub use crate::algs::halo::halo_update;
    pub use crate::coarsen::{Coarsen, CollapseDecision};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::{Dim, ElementProperty};
    pub use crate::mesh::{edge_key, Edge, Mesh, INVALID};
    pub use crate::mesh_error::MeshAdaptError;
    pub use crate::smooth::{Smooth, SmoothMethod};
    pub use crate::surface::Surface;
}
