use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    Page, PageRequest, Result, SagaFilter, SagaId, SagaRecord, StepRecord, StoreError, Version,
    store::{SagaStore, validate_insert, validate_update},
};

#[derive(Debug, Default)]
struct Tables {
    sagas: HashMap<SagaId, SagaRecord>,
    steps: HashMap<SagaId, HashMap<String, StepRecord>>,
}

/// In-memory saga store for tests and single-process deployments.
///
/// Both tables sit behind one lock, so an instance write and its step
/// record land together or not at all.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.tables.read().await.sagas.len()
    }

    /// Returns the total number of step records stored.
    pub async fn step_record_count(&self) -> usize {
        self.tables
            .read()
            .await
            .steps
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Clears all sagas and step records.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.sagas.clear();
        tables.steps.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, saga: &SagaRecord) -> Result<()> {
        validate_insert(saga)?;

        let mut tables = self.tables.write().await;
        if tables.sagas.contains_key(&saga.id) {
            return Err(StoreError::DuplicateSaga(saga.id));
        }
        tables.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn update(&self, saga: &SagaRecord, step: Option<&StepRecord>) -> Result<Version> {
        validate_update(saga, step)?;

        let mut tables = self.tables.write().await;
        let stored = tables
            .sagas
            .get_mut(&saga.id)
            .ok_or(StoreError::SagaNotFound(saga.id))?;

        if stored.version != saga.version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.id,
                expected: saga.version,
                actual: stored.version,
            });
        }

        let now = Utc::now();
        let new_version = saga.version.next();
        *stored = SagaRecord {
            version: new_version,
            updated_at: now,
            ..saga.clone()
        };

        if let Some(step) = step {
            let mut step = step.clone();
            step.updated_at = now;
            tables
                .steps
                .entry(saga.id)
                .or_default()
                .insert(step.step_name.clone(), step);
        }

        Ok(new_version)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.tables.read().await.sagas.get(&saga_id).cloned())
    }

    async fn get_steps(&self, saga_id: SagaId) -> Result<Vec<StepRecord>> {
        let tables = self.tables.read().await;
        let mut steps: Vec<_> = tables
            .steps
            .get(&saga_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn list(&self, filter: &SagaFilter, page: PageRequest) -> Result<Page<SagaRecord>> {
        let tables = self.tables.read().await;
        let mut matching: Vec<_> = tables
            .sagas
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();

        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn list_resumable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaId>> {
        let tables = self.tables.read().await;
        let mut resumable: Vec<_> = tables
            .sagas
            .values()
            .filter(|s| !s.status.is_terminal() && s.updated_at <= stale_before)
            .map(|s| (s.updated_at, s.id))
            .collect();
        resumable.sort();
        Ok(resumable.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}
