//! Service Layer Error Types
//!
//! This module defines error types for tree operations, separating the
//! failures the lock manager may retry (deadlocks) from programming errors
//! and broken correlations that must surface immediately.

use crate::db::DatabaseError;
use crate::models::TreeShapeError;
use thiserror::Error;

/// Tree operation errors
#[derive(Error, Debug)]
pub enum TreeServiceError {
    /// Node not found by ID
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// Channel not found by ID
    #[error("Channel not found: {id}")]
    ChannelNotFound { id: String },

    /// A move that would break the tree (onto itself or into its own subtree)
    #[error("Invalid move: {0}")]
    InvalidMove(String),

    /// Caller broke a precondition (e.g. space requested on every tree at once)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A dependent record points at something the copy never produced
    #[error("Missing correlation for {record} {id}")]
    MissingCorrelation { record: &'static str, id: String },

    /// Stored coordinates do not form a valid nested set
    #[error("Corrupt tree: {0}")]
    CorruptTree(#[from] TreeShapeError),

    /// Database operation failed
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),
}

impl TreeServiceError {
    /// Create a node not found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    /// Create a channel not found error
    pub fn channel_not_found(id: impl Into<String>) -> Self {
        Self::ChannelNotFound { id: id.into() }
    }

    /// Create an invalid move error
    pub fn invalid_move(msg: impl Into<String>) -> Self {
        Self::InvalidMove(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a missing correlation error
    pub fn missing_correlation(record: &'static str, id: impl Into<String>) -> Self {
        Self::MissingCorrelation {
            record,
            id: id.into(),
        }
    }

    /// Whether the failure came from lock contention and may succeed in a
    /// fresh transaction.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_deadlock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_database_deadlocks_are_retryable() {
        let deadlock: TreeServiceError = DatabaseError::deadlock("tree 1").into();
        assert!(deadlock.is_deadlock());

        let other: TreeServiceError = DatabaseError::sql_execution("boom").into();
        assert!(!other.is_deadlock());

        assert!(!TreeServiceError::invariant_violation("all trees").is_deadlock());
        assert!(!TreeServiceError::missing_correlation("node", "x").is_deadlock());
    }

    #[test]
    fn test_missing_correlation_message() {
        let err = TreeServiceError::missing_correlation("assessment item", "abc:q1");
        assert_eq!(err.to_string(), "Missing correlation for assessment item abc:q1");
    }
}
