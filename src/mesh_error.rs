//! MeshError: unified error type for hexref public APIs
//!
//! Every fallible operation in the crate returns `Result<_, MeshError>`. The
//! three refinement-specific kinds (`Invariant`, `NonConverged`,
//! `TopologyCorruption`) are all recovered at the boundary of one refinement
//! cycle: a failed cycle publishes nothing.

use thiserror::Error;

/// Unified error type for hexref operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// A requested operation violates a structural invariant: merging a group
    /// that is not an intact sibling octet, splitting a cell that is not a
    /// hexahedron, or an edit script that references dead entities.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The 2:1 balance relaxation kept changing after the round budget.
    #[error("2:1 balance did not converge after {rounds} rounds")]
    NonConverged {
        /// Rounds performed before giving up.
        rounds: usize,
    },
    /// A committed mesh failed its sanity checks. The mesh can no longer be
    /// trusted.
    #[error("topology corruption: {0}")]
    TopologyCorruption(String),
    /// Caller-supplied data does not match the mesh (sizes, ids).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Transport failure in a communicator backend.
    #[error("communication error: {0}")]
    CommError(String),
    /// Checkpoint (de)serialisation failed or the format is incompatible.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl MeshError {
    /// `true` when no safe continuation exists.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::TopologyCorruption(_))
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        MeshError::Invariant(message.into())
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        MeshError::TopologyCorruption(message.into())
    }

    pub(crate) fn input(message: impl Into<String>) -> Self {
        MeshError::InvalidInput(message.into())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Checkpoint(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_corruption_is_fatal() {
        assert!(MeshError::corruption("dangling point").is_fatal());
        assert!(!MeshError::invariant("partial octet").is_fatal());
        assert!(!MeshError::NonConverged { rounds: 3 }.is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let err = MeshError::NonConverged { rounds: 12 };
        assert_eq!(err.to_string(), "2:1 balance did not converge after 12 rounds");
    }
}
