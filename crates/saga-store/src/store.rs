use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Page, PageRequest, Result, SagaFilter, SagaId, SagaRecord, StepRecord, StoreError, Version,
};

/// Core trait for saga store implementations.
///
/// The store is the only shared mutable state of the orchestrator. Every
/// mutation is one atomic transaction touching one saga instance and at most
/// one step record, guarded by a compare-and-set on the instance version.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a newly accepted saga.
    ///
    /// The record must be at [`Version::first`]. Fails with `DuplicateSaga`
    /// if the ID is already taken.
    async fn insert(&self, saga: &SagaRecord) -> Result<()>;

    /// Persists a saga transition, optionally with one step record, atomically.
    ///
    /// `saga.version` is the version the caller read. If the stored version
    /// differs, the write is rejected with `ConcurrencyConflict` and nothing
    /// is changed. The step record is upserted on `(saga_id, step_name)`.
    ///
    /// Returns the new version of the saga after the write.
    async fn update(&self, saga: &SagaRecord, step: Option<&StepRecord>) -> Result<Version>;

    /// Retrieves a saga instance.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Retrieves every step record of a saga ordered by step index.
    async fn get_steps(&self, saga_id: SagaId) -> Result<Vec<StepRecord>>;

    /// Lists sagas matching a filter, oldest first.
    async fn list(&self, filter: &SagaFilter, page: PageRequest) -> Result<Page<SagaRecord>>;

    /// Returns non-terminal sagas last touched at or before `stale_before`,
    /// least recently updated first.
    ///
    /// This is the polling scan used by recovery workers.
    async fn list_resumable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaId>>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads a saga together with its ordered step records.
    async fn load(&self, saga_id: SagaId) -> Result<(SagaRecord, Vec<StepRecord>)> {
        let saga = self
            .get(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))?;
        let steps = self.get_steps(saga_id).await?;
        Ok((saga, steps))
    }

    /// Checks if a saga exists.
    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.get(saga_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Validates a record before it is inserted.
pub fn validate_insert(saga: &SagaRecord) -> Result<()> {
    if saga.version != Version::first() {
        return Err(StoreError::InvalidWrite(format!(
            "new saga {} must start at version {}, got {}",
            saga.id,
            Version::first(),
            saga.version
        )));
    }
    if saga.status.is_terminal() {
        return Err(StoreError::InvalidWrite(format!(
            "new saga {} cannot start in terminal status {}",
            saga.id, saga.status
        )));
    }
    Ok(())
}

/// Validates that a step record belongs to the saga it is written with.
pub fn validate_update(saga: &SagaRecord, step: Option<&StepRecord>) -> Result<()> {
    if let Some(step) = step
        && step.saga_id != saga.id
    {
        return Err(StoreError::InvalidWrite(format!(
            "step '{}' belongs to saga {}, not {}",
            step.step_name, step.saga_id, saga.id
        )));
    }
    Ok(())
}
