use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Payload, SagaId, SagaStatus, StepStatus};

/// Version number for a saga instance, used for optimistic concurrency control.
///
/// A freshly inserted saga is at version 1; every persisted mutation
/// increments it by exactly 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the first version (1) of a newly inserted saga.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A persisted saga instance.
///
/// Row shape of `saga_instances`. Only the orchestrator mutates it; every
/// write goes through [`SagaStore::update`](crate::SagaStore::update) with
/// `version` as the expected version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub saga_type: String,
    pub definition_version: u32,
    pub status: SagaStatus,
    pub payload: Payload,
    pub failure_reason: Option<String>,
    pub version: Version,
    pub deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record for a newly accepted saga, already `Running` at version 1.
    pub fn new(saga_type: impl Into<String>, definition_version: u32, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            definition_version,
            status: SagaStatus::Running,
            payload,
            failure_reason: None,
            version: Version::first(),
            deadline_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the saga-level deadline.
    pub fn with_deadline(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    /// Returns true if the deadline has passed at `now`.
    pub fn deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|deadline| now > deadline)
    }
}

/// A persisted step execution record.
///
/// Row shape of `saga_step_records`, unique on `(saga_id, step_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub saga_id: SagaId,
    pub step_name: String,
    /// Position of the step in its saga definition.
    pub step_index: u32,
    pub status: StepStatus,
    /// Output of a successful forward call; input of its compensation.
    pub captured_output: Option<Payload>,
    pub attempt_count: u32,
    pub compensation_attempt_count: u32,
    /// Idempotency key generation; bumped only by an operator retry.
    pub generation: u32,
    pub failure_reason: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    /// Creates a record for the first attempt of a step.
    pub fn new(saga_id: SagaId, step_name: impl Into<String>, step_index: u32) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            step_name: step_name.into(),
            step_index,
            status: StepStatus::Pending,
            captured_output: None,
            attempt_count: 0,
            compensation_attempt_count: 0,
            generation: 1,
            failure_reason: None,
            executed_at: now,
            updated_at: now,
        }
    }
}
