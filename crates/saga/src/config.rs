use std::time::Duration;

use crate::retry::RetryPolicy;

/// Engine-wide execution settings.
///
/// Per-step timeouts and per-definition deadlines registered with a
/// [`SagaDefinition`](crate::SagaDefinition) take precedence over these.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub forward_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
    /// Upper bound for a single handler call; exceeding it counts as retryable.
    pub step_timeout: Duration,
    /// Time from insert after which a running saga is compensated instead of advanced.
    pub saga_deadline: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            forward_retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::for_compensation(),
            step_timeout: Duration::from_secs(30),
            saga_deadline: None,
        }
    }
}

impl EngineConfig {
    /// Sets the forward retry policy.
    pub fn with_forward_retry(mut self, policy: RetryPolicy) -> Self {
        self.forward_retry = policy;
        self
    }

    /// Sets the compensation retry policy.
    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = policy;
        self
    }

    /// Sets the default per-step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Sets the default saga deadline.
    pub fn with_saga_deadline(mut self, deadline: Duration) -> Self {
        self.saga_deadline = Some(deadline);
        self
    }
}
