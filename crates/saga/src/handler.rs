//! The contract every external step action implements.

use std::future::Future;

use async_trait::async_trait;
use common::{Payload, SagaId};
use serde::{Deserialize, Serialize};

/// Deterministic key attached to every handler call.
///
/// The engine invokes handlers at least once; a handler that sees the same
/// key twice must produce a single effective outcome. Keys only depend on
/// persisted state, so a call repeated after a crash carries the key of the
/// original attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key of a forward call: `{saga_id}/{step_name}/{generation}`.
    pub fn forward(saga_id: SagaId, step_name: &str, generation: u32) -> Self {
        Self(format!("{saga_id}/{step_name}/{generation}"))
    }

    /// Key of a compensation call: the forward key suffixed with `/compensate`.
    pub fn compensation(saga_id: SagaId, step_name: &str, generation: u32) -> Self {
        Self(format!("{saga_id}/{step_name}/{generation}/compensate"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Information about the call a handler is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step_name: String,
    /// 1-based attempt number within the current retry loop.
    pub attempt: u32,
}

/// Classified result of a handler call.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    /// The action took effect.
    Success(T),
    /// Transient failure; the engine retries with backoff.
    Retryable(String),
    /// Permanent failure; no retry.
    Fatal(String),
}

impl<T> StepOutcome<T> {
    /// Creates a retryable failure.
    pub fn retryable(reason: impl Into<String>) -> Self {
        StepOutcome::Retryable(reason.into())
    }

    /// Creates a fatal failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        StepOutcome::Fatal(reason.into())
    }

    /// Returns true if the outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }
}

/// An external action with its compensating action.
///
/// Handlers are registered once per `(saga_type, step_name)` at startup and
/// are treated as stateless by the engine.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Performs the step. The returned payload is captured and later handed
    /// to [`compensate`](Self::compensate).
    async fn forward(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        payload: &Payload,
    ) -> StepOutcome<Payload>;

    /// Semantically undoes a completed step given its captured output.
    async fn compensate(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        captured_output: &Payload,
    ) -> StepOutcome<()>;
}

/// Adapts a pair of async closures into a [`StepHandler`].
pub struct FnStepHandler<F, C> {
    forward: F,
    compensate: C,
}

impl<F, C> FnStepHandler<F, C> {
    /// Creates a handler from forward and compensate closures.
    pub fn new(forward: F, compensate: C) -> Self {
        Self {
            forward,
            compensate,
        }
    }
}

#[async_trait]
impl<F, FFut, C, CFut> StepHandler for FnStepHandler<F, C>
where
    F: Fn(StepContext, IdempotencyKey, Payload) -> FFut + Send + Sync,
    FFut: Future<Output = StepOutcome<Payload>> + Send,
    C: Fn(StepContext, IdempotencyKey, Payload) -> CFut + Send + Sync,
    CFut: Future<Output = StepOutcome<()>> + Send,
{
    async fn forward(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        payload: &Payload,
    ) -> StepOutcome<Payload> {
        (self.forward)(ctx.clone(), key.clone(), payload.clone()).await
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        captured_output: &Payload,
    ) -> StepOutcome<()> {
        (self.compensate)(ctx.clone(), key.clone(), captured_output.clone()).await
    }
}
