//! Saga worker daemon entry point.

use std::net::SocketAddr;

use saga_store::{InMemorySagaStore, PostgresSagaStore};
use saga_worker::{Config, LogFormat, WorkerError};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Serve Prometheus metrics
    let metrics_addr: SocketAddr =
        config
            .metrics_addr
            .parse()
            .map_err(|source| WorkerError::MetricsAddr {
                addr: config.metrics_addr.clone(),
                source,
            })?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    saga_worker::describe_metrics();
    tracing::info!(%metrics_addr, "serving Prometheus metrics");

    // 3. Wire shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // 4. Run workers over the configured store
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.worker_count.max(1) as u32 + 2)
                .connect(url)
                .await?;
            let store = PostgresSagaStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga store");

            saga_worker::run(store, &config, shutdown_rx).await?;
        }
        None => {
            if let Some(notice) = saga_worker::ephemeral_store_notice(&config) {
                tracing::warn!("{notice}");
            }
            saga_worker::run(InMemorySagaStore::new(), &config, shutdown_rx).await?;
        }
    }

    tracing::info!("saga worker shut down gracefully");
    Ok(())
}
