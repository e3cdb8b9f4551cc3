//! Shared types for the saga orchestrator workspace.

mod types;

pub use types::{Payload, SagaId};
