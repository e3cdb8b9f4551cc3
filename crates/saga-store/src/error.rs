use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The saga was written with a stale version.
    /// Another writer advanced it since it was read.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga was not found in the store.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga with this ID already exists.
    #[error("Saga already exists: {0}")]
    DuplicateSaga(SagaId),

    /// A write that breaks the one-instance, one-record mutation shape.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// A persisted row could not be mapped back to a record.
    #[error("Corrupt saga data: {0}")]
    Corrupt(String),

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
    /// Returns true if the write lost an optimistic concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
