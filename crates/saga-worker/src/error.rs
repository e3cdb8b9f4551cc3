//! Daemon startup and runtime errors.

use saga::SagaError;
use saga_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid metrics address '{addr}': {source}")]
    MetricsAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("Failed to install Prometheus exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}
