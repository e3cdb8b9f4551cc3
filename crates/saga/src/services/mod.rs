//! In-memory external services backing the order fulfillment saga.
//!
//! Each service is a [`StepHandler`](crate::StepHandler) that remembers the
//! idempotency keys it has served, so repeated deliveries take effect once.

pub mod inventory;
pub mod notification;
pub mod payment;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use common::Payload;

use crate::handler::StepOutcome;

pub use inventory::InMemoryInventoryService;
pub use notification::{InMemoryNotificationService, MessageKind, SentMessage};
pub use payment::InMemoryPaymentService;

/// A failure injected into a service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every affected call fails permanently with this reason.
    Fatal(String),
    /// Every affected call fails transiently with this reason.
    Retryable(String),
}

impl Fault {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Fault::Fatal(reason.into())
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Fault::Retryable(reason.into())
    }

    fn outcome<T>(&self) -> StepOutcome<T> {
        match self {
            Fault::Fatal(reason) => StepOutcome::Fatal(reason.clone()),
            Fault::Retryable(reason) => StepOutcome::Retryable(reason.clone()),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn str_field<'a>(payload: &'a Payload, field: &str) -> Result<&'a str, String> {
    payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| format!("invalid payload: '{field}' must be a string"))
}

fn u64_field(payload: &Payload, field: &str) -> Result<u64, String> {
    payload
        .get(field)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| format!("invalid payload: '{field}' must be a non-negative integer"))
}

fn f64_field(payload: &Payload, field: &str) -> Result<f64, String> {
    payload
        .get(field)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| format!("invalid payload: '{field}' must be a number"))
}
