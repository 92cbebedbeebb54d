//! Database Error Types
//!
//! This module defines error types for persistence operations, providing
//! clear error handling for connection, initialization, query and lock
//! failures.

use std::path::PathBuf;
use thiserror::Error;

/// Database operation errors
///
/// Lock contention reported by the backend surfaces as [`DatabaseError::Deadlock`]
/// so the tree lock manager can retry it; everything else propagates as-is.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish database connection
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Permission denied when accessing database
    #[error("Permission denied for database path: {path}")]
    PermissionDenied { path: PathBuf },

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// libsql operation error
    #[error("Database operation failed: {0}")]
    LibsqlError(#[from] libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },

    /// A lock wait was aborted by the backend (busy, locked, deadlock)
    #[error("Deadlock detected: {context}")]
    Deadlock { context: String },

    /// Stored row could not be converted into a model
    #[error("Row conversion failed: {context}")]
    RowConversion { context: String },

    /// JSON column could not be (de)serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transaction already committed or rolled back
    #[error("Transaction is no longer active")]
    TransactionClosed,
}

impl DatabaseError {
    /// Create a connection failed error
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    /// Create an initialization failed error
    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::PermissionDenied { path }
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }

    /// Create a deadlock error with context
    pub fn deadlock(context: impl Into<String>) -> Self {
        Self::Deadlock {
            context: context.into(),
        }
    }

    /// Create a row conversion error with context
    pub fn row_conversion(context: impl Into<String>) -> Self {
        Self::RowConversion {
            context: context.into(),
        }
    }

    /// Classify a libsql failure.
    ///
    /// SQLite reports lock contention as `SQLITE_BUSY` / `database is locked`;
    /// those become [`DatabaseError::Deadlock`], anything else a
    /// [`DatabaseError::SqlExecutionError`] carrying `context`.
    pub fn from_libsql(context: &str, error: libsql::Error) -> Self {
        let message = error.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("database is locked")
            || lowered.contains("busy")
            || lowered.contains("deadlock")
        {
            Self::deadlock(format!("{}: {}", context, message))
        } else {
            Self::sql_execution(format!("{}: {}", context, message))
        }
    }

    /// Whether a fresh transaction could succeed where this one failed.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_classification() {
        assert!(DatabaseError::deadlock("tree 3").is_deadlock());
        assert!(!DatabaseError::sql_execution("syntax error").is_deadlock());
        assert!(!DatabaseError::TransactionClosed.is_deadlock());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = DatabaseError::deadlock("locking tree 4");
        assert_eq!(err.to_string(), "Deadlock detected: locking tree 4");

        let err = DatabaseError::row_conversion("column 3");
        assert!(err.to_string().contains("column 3"));
    }
}
