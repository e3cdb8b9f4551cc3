//! Payment charging service.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::Payload;

use super::{Fault, f64_field, read, str_field, write};
use crate::handler::{IdempotencyKey, StepContext, StepHandler, StepOutcome};

#[derive(Debug, Default)]
struct PaymentState {
    /// Active charges by payment ID, amount in cents.
    payments: HashMap<String, u64>,
    served: HashMap<IdempotencyKey, Payload>,
    refunded: HashSet<IdempotencyKey>,
    next_id: u32,
    refund_count: u32,
    fail_on_charge: Option<Fault>,
    fail_on_refund: Option<Fault>,
}

/// In-memory payment provider charging for `ChargePayment` and refunding on
/// compensation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<PaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every charge fail with `fault` until cleared.
    pub fn set_fail_on_charge(&self, fault: Option<Fault>) {
        write(&self.state).fail_on_charge = fault;
    }

    /// Makes every refund fail with `fault` until cleared.
    pub fn set_fail_on_refund(&self, fault: Option<Fault>) {
        write(&self.state).fail_on_refund = fault;
    }

    /// Returns the number of active payments.
    pub fn payment_count(&self) -> usize {
        read(&self.state).payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        read(&self.state).payments.contains_key(payment_id)
    }

    /// Number of refunds that took effect.
    pub fn refund_count(&self) -> u32 {
        read(&self.state).refund_count
    }
}

#[async_trait]
impl StepHandler for InMemoryPaymentService {
    async fn forward(
        &self,
        _ctx: &StepContext,
        key: &IdempotencyKey,
        payload: &Payload,
    ) -> StepOutcome<Payload> {
        let mut state = write(&self.state);

        if let Some(output) = state.served.get(key) {
            return StepOutcome::Success(output.clone());
        }
        if let Some(fault) = &state.fail_on_charge {
            return fault.outcome();
        }

        let amount = match f64_field(payload, "amount") {
            Ok(amount) if amount > 0.0 => amount,
            Ok(_) => return StepOutcome::fatal("invalid payload: 'amount' must be positive"),
            Err(e) => return StepOutcome::Fatal(e),
        };
        let cents = (amount * 100.0).round() as u64;

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(payment_id.clone(), cents);

        let mut output = Payload::new();
        output.insert("paymentId".into(), serde_json::json!(payment_id));
        output.insert("amountCents".into(), serde_json::json!(cents));
        state.served.insert(key.clone(), output.clone());

        StepOutcome::Success(output)
    }

    async fn compensate(
        &self,
        _ctx: &StepContext,
        key: &IdempotencyKey,
        captured_output: &Payload,
    ) -> StepOutcome<()> {
        let mut state = write(&self.state);

        if state.refunded.contains(key) {
            return StepOutcome::Success(());
        }
        if let Some(fault) = &state.fail_on_refund {
            return fault.outcome();
        }

        let payment_id = match str_field(captured_output, "paymentId") {
            Ok(id) => id,
            Err(e) => return StepOutcome::Fatal(e),
        };

        if state.payments.remove(payment_id).is_some() {
            state.refund_count += 1;
        }
        state.refunded.insert(key.clone());

        StepOutcome::Success(())
    }
}
