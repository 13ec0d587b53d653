//! Error types for the explore services.

use std::time::Duration;

use gb_constraint::ConstraintError;
use thiserror::Error;

use crate::tree::NodeId;

/// Errors that can occur while loading the tree or computing counts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExploreError {
    /// A query object from the backend could not be parsed.
    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    /// A collaborator call failed (network error, non-2xx answer, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A fan-out did not complete before its deadline.
    #[error("fan-out timed out after {0:?}")]
    Timeout(Duration),

    /// Some branches of a multi-node fan-out failed.
    #[error("{failed} of {total} nodes failed: {message}")]
    FanOut {
        /// Number of failed branches.
        failed: usize,
        /// Number of branches.
        total: usize,
        /// Message of the first failure.
        message: String,
    },

    /// Modifier concept extraction was called on a non-modifier node.
    #[error("tree node is not a modifier: {0}")]
    NotAModifier(String),

    /// A modifier node has no applied concept to resolve.
    #[error("modifier node has no applied concept: {0}")]
    MissingAppliedConcept(String),

    /// A node id does not exist in the forest.
    #[error("tree node not found: {0}")]
    NodeNotFound(NodeId),

    /// The crypto collaborator failed.
    #[error("decryption failed: {0}")]
    Crypto(String),
}

/// Result type for explore operations.
pub type ExploreResult<T> = std::result::Result<T, ExploreError>;
