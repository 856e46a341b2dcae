//! Invariant validation hooks.
//!
//! The adjacency tables form a cyclic web (NNList ↔ edges ↔ NEList ↔
//! elements) that every topology mutation must keep consistent. The
//! [`DebugInvariants`] trait gives a uniform entry point for checking that
//! web, cheap enough to sprinkle through tests and gated builds.

use crate::mesh::Mesh;
use crate::mesh_error::MeshAdaptError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Assert invariants in debug builds or when invariant checking is
    /// enabled via the `check-invariants` feature.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), MeshAdaptError>;
}

/// Run a fallible check and panic on error when invariant checking is
/// enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

impl DebugInvariants for Mesh {
    fn debug_assert_invariants(&self) {
        debug_invariants!(Mesh::validate_invariants(self), "mesh adjacency");
    }

    fn validate_invariants(&self) -> Result<(), MeshAdaptError> {
        Mesh::validate_invariants(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_mesh_passes_assertions() {
        let mesh = Mesh::new_2d(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0], &[0, 1, 2]);
        mesh.debug_assert_invariants();
        DebugInvariants::validate_invariants(&mesh).unwrap();
    }
}
