//! Order fulfillment saga: reserve stock, charge the customer, confirm.

use std::sync::Arc;

use common::Payload;

use crate::error::Result;
use crate::registry::{SagaDefinition, StepRegistry};
use crate::services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "ReserveInventory";

/// Step name: Charge the customer for the order.
pub const STEP_CHARGE_PAYMENT: &str = "ChargePayment";

/// Step name: Send the order confirmation.
pub const STEP_SEND_CONFIRMATION: &str = "SendConfirmation";

pub const REQUIRED_FIELDS: [&str; 4] = ["orderId", "sku", "qty", "amount"];

/// The services the saga's steps call.
#[derive(Debug, Clone, Default)]
pub struct OrderServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub notification: InMemoryNotificationService,
}

impl OrderServices {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the order fulfillment definition over `services`.
pub fn definition(services: &OrderServices) -> Result<SagaDefinition> {
    REQUIRED_FIELDS
        .iter()
        .fold(SagaDefinition::builder(SAGA_TYPE), |builder, field| {
            builder.required_field(*field)
        })
        .step(STEP_RESERVE_INVENTORY, Arc::new(services.inventory.clone()))
        .step(STEP_CHARGE_PAYMENT, Arc::new(services.payment.clone()))
        .step(
            STEP_SEND_CONFIRMATION,
            Arc::new(services.notification.clone()),
        )
        .build()
}

/// Registers the order fulfillment saga.
pub fn register(registry: &mut StepRegistry, services: &OrderServices) -> Result<()> {
    registry.register(definition(services)?)
}

/// Builds an order fulfillment payload.
pub fn payload(order_id: &str, sku: &str, qty: u64, amount: f64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("orderId".into(), serde_json::json!(order_id));
    payload.insert("sku".into(), serde_json::json!(sku));
    payload.insert("qty".into(), serde_json::json!(qty));
    payload.insert("amount".into(), serde_json::json!(amount));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_declares_steps_in_order() {
        let definition = definition(&OrderServices::new()).unwrap();
        let names: Vec<&str> = definition.steps.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(definition.saga_type, SAGA_TYPE);
        assert_eq!(
            names,
            vec![
                STEP_RESERVE_INVENTORY,
                STEP_CHARGE_PAYMENT,
                STEP_SEND_CONFIRMATION
            ]
        );
    }

    #[test]
    fn test_payload_satisfies_definition() {
        let definition = definition(&OrderServices::new()).unwrap();
        assert!(definition.validate(&payload("O1", "X", 2, 49.98)).is_ok());

        let mut incomplete = payload("O1", "X", 2, 49.98);
        incomplete.remove("amount");
        assert!(definition.validate(&incomplete).is_err());
    }
}
