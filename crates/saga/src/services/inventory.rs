//! Inventory reservation service.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::Payload;

use super::{Fault, read, str_field, u64_field, write};
use crate::handler::{IdempotencyKey, StepContext, StepHandler, StepOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reservation {
    sku: String,
    qty: u64,
}

#[derive(Debug, Default)]
struct InventoryState {
    /// Available units per SKU; SKUs not listed are unlimited.
    stock: HashMap<String, u64>,
    reservations: HashMap<String, Reservation>,
    served: HashMap<IdempotencyKey, Payload>,
    released: HashSet<IdempotencyKey>,
    next_id: u32,
    reserve_calls: u32,
    release_calls: u32,
    fail_on_reserve: Option<Fault>,
    fail_on_release: Option<Fault>,
}

/// In-memory inventory that reserves stock for `ReserveInventory` and
/// releases it on compensation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the available units of a SKU.
    pub fn set_stock(&self, sku: &str, qty: u64) {
        write(&self.state).stock.insert(sku.to_string(), qty);
    }

    /// Returns the available units of a tracked SKU.
    pub fn stock(&self, sku: &str) -> Option<u64> {
        read(&self.state).stock.get(sku).copied()
    }

    /// Makes every reservation fail with `fault` until cleared.
    pub fn set_fail_on_reserve(&self, fault: Option<Fault>) {
        write(&self.state).fail_on_reserve = fault;
    }

    /// Makes every release fail with `fault` until cleared.
    pub fn set_fail_on_release(&self, fault: Option<Fault>) {
        write(&self.state).fail_on_release = fault;
    }

    /// Returns the number of reservations currently held.
    pub fn reservation_count(&self) -> usize {
        read(&self.state).reservations.len()
    }

    /// Returns true if the reservation exists.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        read(&self.state).reservations.contains_key(reservation_id)
    }

    /// Number of reserve calls received, including repeats and failures.
    pub fn reserve_calls(&self) -> u32 {
        read(&self.state).reserve_calls
    }

    /// Number of release calls received, including repeats and failures.
    pub fn release_calls(&self) -> u32 {
        read(&self.state).release_calls
    }
}

#[async_trait]
impl StepHandler for InMemoryInventoryService {
    async fn forward(
        &self,
        _ctx: &StepContext,
        key: &IdempotencyKey,
        payload: &Payload,
    ) -> StepOutcome<Payload> {
        let mut state = write(&self.state);
        state.reserve_calls += 1;

        if let Some(output) = state.served.get(key) {
            return StepOutcome::Success(output.clone());
        }
        if let Some(fault) = &state.fail_on_reserve {
            return fault.outcome();
        }

        let (order_id, sku, qty) = match (
            str_field(payload, "orderId"),
            str_field(payload, "sku"),
            u64_field(payload, "qty"),
        ) {
            (Ok(order_id), Ok(sku), Ok(qty)) => (order_id.to_string(), sku.to_string(), qty),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return StepOutcome::Fatal(e),
        };

        if let Some(available) = state.stock.get_mut(&sku) {
            if *available < qty {
                return StepOutcome::fatal("insufficient_stock");
            }
            *available -= qty;
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            Reservation {
                sku: sku.clone(),
                qty,
            },
        );

        let mut output = Payload::new();
        output.insert("reservationId".into(), serde_json::json!(reservation_id));
        output.insert("orderId".into(), serde_json::json!(order_id));
        output.insert("sku".into(), serde_json::json!(sku));
        output.insert("qty".into(), serde_json::json!(qty));
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
        state.release_calls += 1;

        if state.released.contains(key) {
            return StepOutcome::Success(());
        }
        if let Some(fault) = &state.fail_on_release {
            return fault.outcome();
        }

        let reservation_id = match str_field(captured_output, "reservationId") {
            Ok(id) => id,
            Err(e) => return StepOutcome::Fatal(e),
        };

        if let Some(reservation) = state.reservations.remove(reservation_id)
            && let Some(available) = state.stock.get_mut(&reservation.sku)
        {
            *available += reservation.qty;
        }
        state.released.insert(key.clone());

        StepOutcome::Success(())
    }
}
