//! Customer notification service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::Payload;

use super::{Fault, read, str_field, write};
use crate::handler::{IdempotencyKey, StepContext, StepHandler, StepOutcome};

/// A message delivered to a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub order_id: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Confirmation,
    /// Sent when a confirmation has to be taken back.
    Retraction,
}

#[derive(Debug, Default)]
struct NotificationState {
    outbox: Vec<SentMessage>,
    served: HashMap<IdempotencyKey, Payload>,
    fail_on_send: Option<Fault>,
}

/// In-memory notifier sending order confirmations for `SendConfirmation`.
///
/// A sent message cannot be unsent; compensation sends a retraction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<NotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send fail with `fault` until cleared.
    pub fn set_fail_on_send(&self, fault: Option<Fault>) {
        write(&self.state).fail_on_send = fault;
    }

    /// Returns every message sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        read(&self.state).outbox.clone()
    }

    fn send(&self, key: &IdempotencyKey, order_id: &str, kind: MessageKind) -> StepOutcome<Payload> {
        let mut state = write(&self.state);

        if let Some(output) = state.served.get(key) {
            return StepOutcome::Success(output.clone());
        }
        if let Some(fault) = &state.fail_on_send {
            return fault.outcome();
        }

        let message_id = format!("MSG-{:04}", state.outbox.len() + 1);
        state.outbox.push(SentMessage {
            message_id: message_id.clone(),
            order_id: order_id.to_string(),
            kind,
        });

        let mut output = Payload::new();
        output.insert("messageId".into(), serde_json::json!(message_id));
        output.insert("orderId".into(), serde_json::json!(order_id));
        state.served.insert(key.clone(), output.clone());

        StepOutcome::Success(output)
    }
}

#[async_trait]
impl StepHandler for InMemoryNotificationService {
    async fn forward(
        &self,
        _ctx: &StepContext,
        key: &IdempotencyKey,
        payload: &Payload,
    ) -> StepOutcome<Payload> {
        match str_field(payload, "orderId") {
            Ok(order_id) => self.send(key, order_id, MessageKind::Confirmation),
            Err(e) => StepOutcome::Fatal(e),
        }
    }

    async fn compensate(
        &self,
        _ctx: &StepContext,
        key: &IdempotencyKey,
        captured_output: &Payload,
    ) -> StepOutcome<()> {
        let order_id = match str_field(captured_output, "orderId") {
            Ok(order_id) => order_id,
            Err(e) => return StepOutcome::Fatal(e),
        };

        match self.send(key, order_id, MessageKind::Retraction) {
            StepOutcome::Success(_) => StepOutcome::Success(()),
            StepOutcome::Retryable(reason) => StepOutcome::Retryable(reason),
            StepOutcome::Fatal(reason) => StepOutcome::Fatal(reason),
        }
    }
}
