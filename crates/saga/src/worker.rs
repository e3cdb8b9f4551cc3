//! Recovery workers that resume sagas abandoned by crashed or stalled drivers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use saga_store::SagaStore;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::error::Result;
use crate::orchestrator::SagaOrchestrator;

/// Polling and concurrency settings for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of sagas resumed concurrently.
    pub worker_count: usize,
    /// Pause between scans.
    pub poll_interval: Duration,
    /// Only sagas untouched for at least this long are picked up, so live
    /// drivers are left alone.
    pub stale_after: Duration,
    /// Maximum number of sagas claimed per scan.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(30),
            batch_size: 32,
        }
    }
}

type ActiveSet = Arc<Mutex<HashSet<SagaId>>>;

/// Marks a saga as being resumed by this pool until dropped.
struct Claim {
    saga_id: SagaId,
    active: ActiveSet,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.saga_id);
        }
    }
}

/// Polls the store for non-terminal sagas and resumes them.
///
/// Several pools, in one process or many, may scan the same store; the
/// version check on every write keeps them from advancing a saga twice.
pub struct WorkerPool<S> {
    orchestrator: SagaOrchestrator<S>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    active: ActiveSet,
}

impl<S: SagaStore + 'static> WorkerPool<S> {
    pub fn new(orchestrator: SagaOrchestrator<S>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            orchestrator,
            config,
            permits,
            active: Arc::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs until `shutdown` flips to true or its sender is dropped, then
    /// waits for in-flight resumes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            workers = self.config.worker_count,
            poll_interval = ?self.config.poll_interval,
            stale_after = ?self.config.stale_after,
            "saga worker pool started"
        );

        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            while in_flight.try_join_next().is_some() {}

            match self.scan().await {
                Ok(ids) => self.dispatch(ids, &mut in_flight).await,
                Err(e) => tracing::warn!(error = %e, "failed to scan for resumable sagas"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender can never signal again
                    if changed.is_err() {
                        tracing::warn!("shutdown channel closed, stopping worker pool");
                        break;
                    }
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "saga worker pool draining");
        while in_flight.join_next().await.is_some() {}
        tracing::info!("saga worker pool stopped");
    }

    /// Performs a single scan and waits for every resume it started.
    ///
    /// Returns the number of sagas resumed.
    pub async fn run_once(&self) -> Result<usize> {
        let ids = self.scan().await?;
        let mut in_flight = JoinSet::new();
        self.dispatch(ids, &mut in_flight).await;

        let started = in_flight.len();
        while in_flight.join_next().await.is_some() {}
        Ok(started)
    }

    async fn scan(&self) -> Result<Vec<SagaId>> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::zero());
        let ids = self
            .orchestrator
            .store()
            .list_resumable(Utc::now() - stale_after, self.config.batch_size)
            .await?;

        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "found resumable sagas");
        }
        Ok(ids)
    }

    async fn dispatch(&self, ids: Vec<SagaId>, in_flight: &mut JoinSet<()>) {
        for saga_id in ids {
            let claim = {
                let Ok(mut active) = self.active.lock() else {
                    tracing::error!("worker pool claim set poisoned");
                    return;
                };
                if !active.insert(saga_id) {
                    continue;
                }
                Claim {
                    saga_id,
                    active: Arc::clone(&self.active),
                }
            };

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                return;
            };

            let orchestrator = self.orchestrator.clone();
            in_flight.spawn(async move {
                let _claim = claim;
                let _permit = permit;
                match orchestrator.resume(saga_id).await {
                    Ok(status) => tracing::debug!(%saga_id, %status, "saga resumed"),
                    Err(e) => tracing::warn!(%saga_id, error = %e, "failed to resume saga"),
                }
            });
        }
    }
}
