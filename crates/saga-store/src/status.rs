//! Saga and step status state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Compensated
///                                 ▲         └──► Failed
///                                 └───────────────┘ (operator retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Durably inserted, no step attempted yet.
    #[default]
    Created,

    /// Forward steps are being executed.
    Running,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed fatally and completed steps are being undone.
    Compensating,

    /// Every completed step was compensated (terminal state).
    Compensated,

    /// A compensation failed; requires an operator retry (terminal state).
    Failed,
}

impl SagaStatus {
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Created,
        SagaStatus::Running,
        SagaStatus::Completed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true while forward steps may still run.
    ///
    /// Recovery treats `Created` and `Running` identically.
    pub fn is_forward(&self) -> bool {
        matches!(self, SagaStatus::Created | SagaStatus::Running)
    }

    /// Returns true if the saga can move directly to `next`.
    ///
    /// `Created -> Compensating` is a cancellation before the first step;
    /// `Failed -> Compensating` is only taken by an operator retry.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (SagaStatus::Created, SagaStatus::Running)
                | (SagaStatus::Created, SagaStatus::Compensating)
                | (SagaStatus::Running, SagaStatus::Completed)
                | (SagaStatus::Running, SagaStatus::Compensating)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
                | (SagaStatus::Compensating, SagaStatus::Failed)
                | (SagaStatus::Failed, SagaStatus::Compensating)
        )
    }

    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "Created",
            SagaStatus::Running => "Running",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown saga status '{s}'")))
    }
}

/// The status of one step's execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// Forward failed retryably and will be attempted again.
    Pending,

    /// Forward succeeded; the captured output is stored with it.
    Completed,

    /// Completed step whose compensation is in progress or was reset by an operator.
    CompensationPending,

    /// Compensation succeeded.
    Compensated,

    /// Compensation failed after exhausting retries.
    CompensationFailed,

    /// Forward failed fatally.
    Failed,
}

impl StepStatus {
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Pending,
        StepStatus::Completed,
        StepStatus::CompensationPending,
        StepStatus::Compensated,
        StepStatus::CompensationFailed,
        StepStatus::Failed,
    ];

    /// Returns true if the step's forward action took effect and has not
    /// been undone yet, i.e. it is eligible for compensation.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::CompensationPending)
    }

    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Completed => "Completed",
            StepStatus::CompensationPending => "CompensationPending",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
            StepStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown step status '{s}'")))
    }
}
