//! Saga error types.

use common::SagaId;
use saga_store::{SagaStatus, StoreError};
use thiserror::Error;

/// Errors surfaced to callers of the orchestrator and query service.
///
/// Step failures are not errors: they are recorded as saga state and
/// observed through the query service.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga definition is registered under this type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The payload does not satisfy the saga definition.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: SagaStatus,
    },

    /// A status change that the saga state machine does not allow.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A step name was registered twice for one saga type.
    #[error("Step '{step}' is already registered for saga type '{saga_type}'")]
    DuplicateStep { saga_type: String, step: String },

    /// The persisted saga does not match its registered definition.
    #[error("Saga {saga_id} does not match its definition: {reason}")]
    DefinitionMismatch { saga_id: SagaId, reason: String },

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
