//! Saga recovery daemon.
//!
//! Registers the bundled saga definitions over a store and keeps a
//! [`WorkerPool`] resuming whatever crashed or stalled drivers left behind,
//! until a shutdown signal arrives.

pub mod config;
pub mod error;

use saga::order_fulfillment::{self, OrderServices};
use saga::{
    EngineConfig, RetryPolicy, SagaOrchestrator, SagaStore, StepRegistry, WorkerConfig,
    WorkerPool,
};
use tokio::sync::watch;

pub use config::{Config, LogFormat};
pub use error::WorkerError;

/// Orchestrator settings derived from the daemon configuration.
pub fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig::default()
        .with_forward_retry(RetryPolicy::default().with_max_attempts(config.max_attempts))
        .with_step_timeout(config.step_timeout)
}

pub fn worker_config(config: &Config) -> WorkerConfig {
    WorkerConfig {
        worker_count: config.worker_count,
        poll_interval: config.poll_interval,
        stale_after: config.stale_after,
        batch_size: config.batch_size,
    }
}

/// Builds an orchestrator over `store` with every bundled saga registered.
pub fn build_orchestrator<S: SagaStore>(
    store: S,
    config: &Config,
    services: &OrderServices,
) -> Result<SagaOrchestrator<S>, WorkerError> {
    let mut registry = StepRegistry::new();
    order_fulfillment::register(&mut registry, services)?;

    tracing::info!(saga_types = ?registry.saga_types(), "registered saga definitions");
    Ok(SagaOrchestrator::new(store, registry, engine_config(config)))
}

/// Startup warning for a daemon with no durable store.
///
/// The in-memory store is private to this process, so no other process can
/// submit sagas to it and a restart loses everything it held.
pub fn ephemeral_store_notice(config: &Config) -> Option<&'static str> {
    match config.database_url {
        Some(_) => None,
        None => Some(
            "DATABASE_URL not set: running on a private in-memory store that nothing else \
             can submit to, so this daemon has no sagas to recover",
        ),
    }
}

/// Registers descriptions for the metrics the orchestrator emits.
pub fn describe_metrics() {
    metrics::describe_counter!("saga_executions_total", "Sagas accepted for execution");
    metrics::describe_counter!("saga_completed", "Sagas that ran every step");
    metrics::describe_counter!("saga_compensated", "Sagas rolled back in full");
    metrics::describe_counter!("saga_failed", "Sagas whose compensation failed");
    metrics::describe_counter!("saga_step_retries_total", "Retried step attempts");
    metrics::describe_counter!(
        "saga_version_conflicts_total",
        "Passes abandoned after losing a version check"
    );
    metrics::describe_histogram!(
        "saga_duration_seconds",
        metrics::Unit::Seconds,
        "Time from submission to a terminal status"
    );
}

/// Runs the worker pool over `store` until `shutdown` flips to true.
pub async fn run<S: SagaStore + 'static>(
    store: S,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let orchestrator = build_orchestrator(store, config, &OrderServices::new())?;
    let pool = WorkerPool::new(orchestrator, worker_config(config));

    pool.run(shutdown).await;
    Ok(())
}
