//! Durable saga execution.
//!
//! The orchestrator never holds a lock on a saga. Every transition is a single
//! store write conditioned on the version read at the start of the pass; a
//! rejected write means another worker advanced the saga, and the pass is
//! abandoned. Handlers may therefore see the same idempotency key more than
//! once and must deduplicate on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Payload, SagaId};
use saga_store::{SagaRecord, SagaStatus, SagaStore, StepRecord, StepStatus};

use crate::config::EngineConfig;
use crate::error::{Result, SagaError};
use crate::handler::{IdempotencyKey, StepContext, StepOutcome};
use crate::registry::{SagaDefinition, StepDefinition, StepRegistry};

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Converts a JSON value into a saga payload, which must be an object.
pub fn payload_from_value(value: serde_json::Value) -> Result<Payload> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SagaError::Validation(format!(
            "saga payload must be a JSON object, found {other}"
        ))),
    }
}

/// Outcome of driving one forward step.
enum ForwardStep {
    Completed,
    /// The saga was moved to `Compensating` in the same write.
    Failed,
    /// The saga deadline passed before or between attempts.
    DeadlineExceeded,
}

/// Drives saga instances through their definitions.
///
/// Cheap to clone; clones share the store, registry and configuration.
pub struct SagaOrchestrator<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    registry: StepRegistry,
    config: EngineConfig,
}

impl<S> Clone for SagaOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SagaStore> SagaOrchestrator<S> {
    /// Creates an orchestrator over a fully populated registry.
    pub fn new(store: S, registry: StepRegistry, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Accepts a saga and drives it until it is terminal or abandoned.
    ///
    /// Only validation and the initial insert can fail the call. Anything
    /// that goes wrong afterwards is recorded on the saga (or logged, for
    /// store errors) and left to recovery; the caller observes the outcome
    /// through [`SagaQueryService`](crate::SagaQueryService).
    #[tracing::instrument(skip(self, payload))]
    pub async fn execute(&self, saga_type: &str, payload: Payload) -> Result<SagaId> {
        let saga_id = self.submit(saga_type, payload).await?;

        if let Err(e) = self.drive(saga_id).await {
            tracing::error!(%saga_id, error = %e, "saga execution interrupted, left for recovery");
        }

        Ok(saga_id)
    }

    /// Accepts a saga without driving it; a [`WorkerPool`](crate::WorkerPool)
    /// or an explicit [`resume`](Self::resume) picks it up.
    #[tracing::instrument(skip(self, payload))]
    pub async fn submit(&self, saga_type: &str, payload: Payload) -> Result<SagaId> {
        let record = self.prepare(saga_type, payload)?;
        self.inner.store.insert(&record).await?;

        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(saga_id = %record.id, "saga accepted");

        Ok(record.id)
    }

    /// Continues a saga from its persisted state and returns its status
    /// after this pass.
    ///
    /// Terminal sagas are returned untouched without invoking any handler.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<SagaStatus> {
        self.drive(saga_id).await
    }

    fn prepare(&self, saga_type: &str, payload: Payload) -> Result<SagaRecord> {
        let definition = self
            .inner
            .registry
            .definition(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))?;
        definition.validate(&payload)?;

        let record = SagaRecord::new(saga_type, definition.version, payload);
        match definition.deadline.or(self.inner.config.saga_deadline) {
            Some(deadline) => {
                let deadline = chrono::Duration::from_std(deadline)
                    .map_err(|e| SagaError::Validation(format!("invalid saga deadline: {e}")))?;
                let deadline_at = record.created_at + deadline;
                Ok(record.with_deadline(deadline_at))
            }
            None => Ok(record),
        }
    }

    fn definition_for(&self, saga: &SagaRecord) -> Result<&SagaDefinition> {
        let definition = self
            .inner
            .registry
            .definition(&saga.saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga.saga_type.clone()))?;

        if definition.version != saga.definition_version {
            return Err(SagaError::DefinitionMismatch {
                saga_id: saga.id,
                reason: format!(
                    "instance was created with version {}, registered version is {}",
                    saga.definition_version, definition.version
                ),
            });
        }
        Ok(definition)
    }

    pub(crate) async fn load_saga(&self, saga_id: SagaId) -> Result<SagaRecord> {
        self.inner
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// One pass over a saga. A lost version check ends the pass with the
    /// status the winning writer left behind.
    pub(crate) async fn drive(&self, saga_id: SagaId) -> Result<SagaStatus> {
        match self.advance(saga_id).await {
            Err(SagaError::Store(e)) if e.is_conflict() => {
                metrics::counter!("saga_version_conflicts_total").increment(1);
                tracing::warn!(%saga_id, error = %e, "saga advanced concurrently, abandoning pass");
                Ok(self.load_saga(saga_id).await?.status)
            }
            other => other,
        }
    }

    async fn advance(&self, saga_id: SagaId) -> Result<SagaStatus> {
        let mut saga = self.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            tracing::debug!(%saga_id, status = %saga.status, "saga already terminal");
            return Ok(saga.status);
        }

        let definition = self.definition_for(&saga)?;

        let status = if saga.status.is_forward() {
            self.run_forward(&mut saga, definition).await?
        } else {
            self.run_compensation(&mut saga, definition).await?
        };

        if status.is_terminal() {
            let duration = (Utc::now() - saga.created_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            metrics::histogram!("saga_duration_seconds").record(duration);
            match status {
                SagaStatus::Completed => metrics::counter!("saga_completed").increment(1),
                SagaStatus::Compensated => metrics::counter!("saga_compensated").increment(1),
                _ => metrics::counter!("saga_failed").increment(1),
            }
            tracing::info!(%saga_id, %status, duration, "saga finished");
        }

        Ok(status)
    }

    /// Writes the saga (and optionally one step record) under the version
    /// the caller holds, then adopts the new version.
    async fn persist(&self, saga: &mut SagaRecord, step: Option<&StepRecord>) -> Result<()> {
        saga.version = self.inner.store.update(saga, step).await?;
        saga.updated_at = Utc::now();
        Ok(())
    }

    fn set_status(saga: &mut SagaRecord, next: SagaStatus) -> Result<()> {
        if !saga.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: saga.status,
                to: next,
            });
        }
        saga.status = next;
        Ok(())
    }

    pub(crate) async fn transition(
        &self,
        saga: &mut SagaRecord,
        next: SagaStatus,
        reason: Option<String>,
    ) -> Result<()> {
        Self::set_status(saga, next)?;
        if reason.is_some() {
            saga.failure_reason = reason;
        }
        self.persist(saga, None).await
    }

    async fn run_forward(
        &self,
        saga: &mut SagaRecord,
        definition: &SagaDefinition,
    ) -> Result<SagaStatus> {
        if saga.status == SagaStatus::Created {
            self.transition(saga, SagaStatus::Running, None).await?;
        }

        let mut records: HashMap<String, StepRecord> = self
            .inner
            .store
            .get_steps(saga.id)
            .await?
            .into_iter()
            .map(|record| (record.step_name.clone(), record))
            .collect();

        for (index, step) in definition.steps.iter().enumerate() {
            let mut record = records
                .remove(&step.name)
                .unwrap_or_else(|| StepRecord::new(saga.id, step.name.as_str(), index as u32));

            if record.status == StepStatus::Completed {
                continue;
            }

            match self.forward_step(saga, step, &mut record).await? {
                ForwardStep::Completed => {}
                ForwardStep::Failed => return self.run_compensation(saga, definition).await,
                ForwardStep::DeadlineExceeded => {
                    tracing::warn!(saga_id = %saga.id, step = %step.name, "saga deadline exceeded");
                    self.transition(
                        saga,
                        SagaStatus::Compensating,
                        Some(DEADLINE_EXCEEDED.to_string()),
                    )
                    .await?;
                    return self.run_compensation(saga, definition).await;
                }
            }
        }

        self.transition(saga, SagaStatus::Completed, None).await?;
        Ok(SagaStatus::Completed)
    }

    async fn forward_step(
        &self,
        saga: &mut SagaRecord,
        step: &StepDefinition,
        record: &mut StepRecord,
    ) -> Result<ForwardStep> {
        let policy = self.inner.config.forward_retry;
        let timeout = step.timeout.unwrap_or(self.inner.config.step_timeout);
        let key = IdempotencyKey::forward(saga.id, &step.name, record.generation);

        loop {
            if saga.deadline_exceeded(Utc::now()) {
                return Ok(ForwardStep::DeadlineExceeded);
            }

            let attempt = record.attempt_count + 1;
            let ctx = StepContext {
                saga_id: saga.id,
                saga_type: saga.saga_type.clone(),
                step_name: step.name.clone(),
                attempt,
            };

            tracing::info!(saga_id = %saga.id, step = %step.name, attempt, "saga step started");
            let outcome = match tokio::time::timeout(
                timeout,
                step.handler.forward(&ctx, &key, &saga.payload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Retryable(timed_out(timeout)),
            };

            let reason = match outcome {
                StepOutcome::Success(output) => {
                    record.status = StepStatus::Completed;
                    record.captured_output = Some(output);
                    record.attempt_count = attempt;
                    record.failure_reason = None;
                    record.executed_at = Utc::now();
                    self.persist(saga, Some(record)).await?;

                    tracing::info!(saga_id = %saga.id, step = %step.name, "saga step completed");
                    return Ok(ForwardStep::Completed);
                }
                StepOutcome::Retryable(reason) if policy.should_retry(attempt) => {
                    metrics::counter!("saga_step_retries_total").increment(1);
                    record.status = StepStatus::Pending;
                    record.attempt_count = attempt;
                    record.failure_reason = Some(reason.clone());
                    record.executed_at = Utc::now();
                    self.persist(saga, Some(record)).await?;

                    if saga.deadline_exceeded(Utc::now()) {
                        return Ok(ForwardStep::DeadlineExceeded);
                    }

                    let delay = capped_by_deadline(saga, policy.delay_for_attempt(attempt));
                    tracing::warn!(
                        saga_id = %saga.id,
                        step = %step.name,
                        attempt,
                        %reason,
                        ?delay,
                        "saga step failed, retrying"
                    );
                    backoff(delay).await;
                    continue;
                }
                StepOutcome::Retryable(reason) => {
                    format!("{reason} (gave up after {attempt} attempts)")
                }
                StepOutcome::Fatal(reason) => reason,
            };

            record.status = StepStatus::Failed;
            record.attempt_count = attempt;
            record.failure_reason = Some(reason.clone());
            record.executed_at = Utc::now();
            Self::set_status(saga, SagaStatus::Compensating)?;
            saga.failure_reason = Some(format!("step {} failed: {reason}", step.name));
            self.persist(saga, Some(record)).await?;

            tracing::warn!(
                saga_id = %saga.id,
                step = %step.name,
                %reason,
                "saga step failed, compensating"
            );
            return Ok(ForwardStep::Failed);
        }
    }

    /// Compensates every step whose forward call took effect, latest first.
    ///
    /// Stops at the first compensation that cannot succeed, leaving the saga
    /// `Failed` for an operator.
    async fn run_compensation(
        &self,
        saga: &mut SagaRecord,
        definition: &SagaDefinition,
    ) -> Result<SagaStatus> {
        let mut records: Vec<StepRecord> = self
            .inner
            .store
            .get_steps(saga.id)
            .await?
            .into_iter()
            .filter(|record| record.status.needs_compensation())
            .collect();
        records.sort_by(|a, b| b.step_index.cmp(&a.step_index));

        for mut record in records {
            let step = definition.step(&record.step_name).ok_or_else(|| {
                SagaError::DefinitionMismatch {
                    saga_id: saga.id,
                    reason: format!("no registered step named '{}'", record.step_name),
                }
            })?;

            if !self.compensate_step(saga, step, &mut record).await? {
                return Ok(SagaStatus::Failed);
            }
        }

        self.transition(saga, SagaStatus::Compensated, None).await?;
        Ok(SagaStatus::Compensated)
    }

    /// Returns false if the compensation failed for good and the saga is now `Failed`.
    async fn compensate_step(
        &self,
        saga: &mut SagaRecord,
        step: &StepDefinition,
        record: &mut StepRecord,
    ) -> Result<bool> {
        let policy = self.inner.config.compensation_retry;
        let timeout = step.timeout.unwrap_or(self.inner.config.step_timeout);
        let key = IdempotencyKey::compensation(saga.id, &step.name, record.generation);
        let captured_output = record.captured_output.clone().unwrap_or_default();

        loop {
            let attempt = record.compensation_attempt_count + 1;
            let ctx = StepContext {
                saga_id: saga.id,
                saga_type: saga.saga_type.clone(),
                step_name: step.name.clone(),
                attempt,
            };

            tracing::warn!(saga_id = %saga.id, step = %step.name, attempt, "compensating saga step");
            let outcome = match tokio::time::timeout(
                timeout,
                step.handler.compensate(&ctx, &key, &captured_output),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Retryable(timed_out(timeout)),
            };

            let reason = match outcome {
                StepOutcome::Success(()) => {
                    record.status = StepStatus::Compensated;
                    record.compensation_attempt_count = attempt;
                    record.failure_reason = None;
                    self.persist(saga, Some(record)).await?;

                    tracing::info!(saga_id = %saga.id, step = %step.name, "saga step compensated");
                    return Ok(true);
                }
                StepOutcome::Retryable(reason) if policy.should_retry(attempt) => {
                    metrics::counter!("saga_step_retries_total").increment(1);
                    record.status = StepStatus::CompensationPending;
                    record.compensation_attempt_count = attempt;
                    record.failure_reason = Some(reason.clone());
                    self.persist(saga, Some(record)).await?;

                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        saga_id = %saga.id,
                        step = %step.name,
                        attempt,
                        %reason,
                        ?delay,
                        "compensation failed, retrying"
                    );
                    backoff(delay).await;
                    continue;
                }
                StepOutcome::Retryable(reason) => {
                    format!("{reason} (gave up after {attempt} attempts)")
                }
                StepOutcome::Fatal(reason) => reason,
            };

            record.status = StepStatus::CompensationFailed;
            record.compensation_attempt_count = attempt;
            record.failure_reason = Some(reason.clone());
            Self::set_status(saga, SagaStatus::Failed)?;
            saga.failure_reason = Some(format!(
                "compensation of step {} failed: {reason}",
                step.name
            ));
            self.persist(saga, Some(record)).await?;

            tracing::error!(
                saga_id = %saga.id,
                step = %step.name,
                %reason,
                "compensation failed, saga requires operator retry"
            );
            return Ok(false);
        }
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("step timed out after {}ms", timeout.as_millis())
}

/// Shortens a retry delay so the saga wakes just after its deadline.
fn capped_by_deadline(saga: &SagaRecord, delay: Duration) -> Duration {
    match saga
        .deadline_at
        .and_then(|deadline| (deadline - Utc::now()).to_std().ok())
    {
        Some(remaining) => delay.min(remaining + Duration::from_millis(1)),
        None => delay,
    }
}

async fn backoff(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
