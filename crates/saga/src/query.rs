//! Read-side queries and operator actions on saga instances.

use common::SagaId;
use saga_store::{
    Page, PageRequest, SagaFilter, SagaRecord, SagaStatus, SagaStore, StepRecord, StepStatus,
};
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::orchestrator::SagaOrchestrator;

const CANCELLED: &str = "cancelled";

/// A saga instance with its step records ordered by step index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaStatusView {
    pub instance: SagaRecord,
    pub steps: Vec<StepRecord>,
}

impl SagaStatusView {
    /// Looks up the record of a step by name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|step| step.step_name == name)
    }
}

/// Status lookups, listing and operator interventions.
///
/// Interventions write through the same version check as the orchestrator
/// and then drive the saga on the caller's task.
pub struct SagaQueryService<S> {
    orchestrator: SagaOrchestrator<S>,
}

impl<S> Clone for SagaQueryService<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<S: SagaStore> SagaQueryService<S> {
    pub fn new(orchestrator: SagaOrchestrator<S>) -> Self {
        Self { orchestrator }
    }

    /// Returns the instance and its step records.
    pub async fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaStatusView> {
        let store = self.orchestrator.store();
        let instance = store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        let steps = store.get_steps(saga_id).await?;

        Ok(SagaStatusView { instance, steps })
    }

    /// Lists instances matching `filter`, oldest first.
    pub async fn list_sagas(
        &self,
        filter: &SagaFilter,
        page: PageRequest,
    ) -> Result<Page<SagaRecord>> {
        Ok(self.orchestrator.store().list(filter, page).await?)
    }

    /// Re-attempts compensation of a `Failed` saga.
    ///
    /// The failed step record is reset to `CompensationPending` under a new
    /// idempotency key generation, in the same write that moves the saga back
    /// to `Compensating`. Returns the status after the resumed compensation.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed_saga(&self, saga_id: SagaId) -> Result<SagaStatus> {
        let view = self.get_saga_status(saga_id).await?;
        let mut saga = view.instance;

        if saga.status != SagaStatus::Failed {
            return Err(SagaError::InvalidState {
                expected: SagaStatus::Failed.to_string(),
                actual: saga.status,
            });
        }

        let mut record = view
            .steps
            .into_iter()
            .find(|step| step.status == StepStatus::CompensationFailed)
            .ok_or_else(|| SagaError::DefinitionMismatch {
                saga_id,
                reason: "failed saga has no step whose compensation failed".to_string(),
            })?;

        record.status = StepStatus::CompensationPending;
        record.compensation_attempt_count = 0;
        record.generation += 1;
        record.failure_reason = None;

        if !saga.status.can_transition_to(SagaStatus::Compensating) {
            return Err(SagaError::InvalidTransition {
                from: saga.status,
                to: SagaStatus::Compensating,
            });
        }
        saga.status = SagaStatus::Compensating;
        saga.version = self
            .orchestrator
            .store()
            .update(&saga, Some(&record))
            .await?;

        tracing::info!(
            %saga_id,
            step = %record.step_name,
            generation = record.generation,
            "retrying failed compensation"
        );

        self.orchestrator.drive(saga_id).await
    }

    /// Stops a running saga and compensates whatever completed.
    ///
    /// A forward call already in flight on another worker is abandoned when
    /// its result fails the version check; its effect is not compensated.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_saga(&self, saga_id: SagaId) -> Result<SagaStatus> {
        loop {
            let mut saga = self.orchestrator.load_saga(saga_id).await?;
            if !saga.status.is_forward() {
                return Err(SagaError::InvalidState {
                    expected: format!("{} or {}", SagaStatus::Created, SagaStatus::Running),
                    actual: saga.status,
                });
            }

            match self
                .orchestrator
                .transition(
                    &mut saga,
                    SagaStatus::Compensating,
                    Some(CANCELLED.to_string()),
                )
                .await
            {
                Ok(()) => break,
                Err(SagaError::Store(e)) if e.is_conflict() => {
                    metrics::counter!("saga_version_conflicts_total").increment(1);
                    tracing::debug!(%saga_id, "saga advanced during cancel, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(%saga_id, "saga cancelled, compensating");
        self.orchestrator.drive(saga_id).await
    }
}
