use std::time::Duration;

use thiserror::Error;

use crate::{CorrelationId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write found a different version than expected.
    #[error(
        "Concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// An insert collided with an existing instance for the same correlation id.
    #[error("Saga instance already exists: {0}")]
    DuplicateKey(CorrelationId),

    /// The row lock could not be acquired within the configured timeout.
    #[error("Timed out after {waited:?} waiting for the lock on saga {correlation_id}")]
    LockTimeout {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    /// The database aborted the transaction because of a serialization failure
    /// or a deadlock. Retrying the whole transaction is safe.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// A table name contained characters that cannot be used as an identifier.
    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for failures that a fresh attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. }
                | StoreError::DuplicateKey(_)
                | StoreError::TransactionConflict(_)
        )
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
