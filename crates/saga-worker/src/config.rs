//! Daemon configuration loaded from environment variables.

use std::time::Duration;

/// Worker daemon configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string; unset runs on the in-memory store
/// - `WORKER_COUNT`: concurrent saga resumes (default: `4`)
/// - `POLL_INTERVAL_MS`: pause between scans (default: `1000`)
/// - `STALE_AFTER_SECS`: idle time before a saga is picked up (default: `30`)
/// - `BATCH_SIZE`: sagas claimed per scan (default: `32`)
/// - `STEP_TIMEOUT_MS`: per-attempt step timeout (default: `30000`)
/// - `MAX_ATTEMPTS`: forward attempts per step (default: `3`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `"json"` for structured output, anything else for text
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: Option<String>,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub batch_size: usize,
    pub step_timeout: Duration,
    pub max_attempts: u32,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            worker_count: parsed("WORKER_COUNT")
                .map(|n| n as usize)
                .unwrap_or(defaults.worker_count),
            poll_interval: parsed("POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            stale_after: parsed("STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            batch_size: parsed("BATCH_SIZE")
                .map(|n| n as usize)
                .unwrap_or(defaults.batch_size),
            step_timeout: parsed("STEP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_timeout),
            max_attempts: parsed("MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_attempts),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_count: 4,
            poll_interval: Duration::from_millis(1000),
            stale_after: Duration::from_secs(30),
            batch_size: 32,
            step_timeout: Duration::from_millis(30_000),
            max_attempts: 3,
            metrics_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}
