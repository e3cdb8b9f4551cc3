//! Durable orchestration of linear sagas.
//!
//! A saga is an ordered list of steps, each pairing an external action with a
//! compensating action. The [`SagaOrchestrator`] runs the steps in order and,
//! when one fails for good, compensates the completed ones in reverse order.
//! All progress is persisted through a [`SagaStore`] so that any process can
//! pick up a saga where a crashed one left off.
//!
//! The bundled order fulfillment saga follows these steps:
//! 1. Reserve inventory
//! 2. Charge payment
//! 3. Send confirmation

pub mod config;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod order_fulfillment;
pub mod query;
pub mod registry;
pub mod retry;
pub mod services;
pub mod worker;

pub use common::{Payload, SagaId};
pub use config::EngineConfig;
pub use error::{Result, SagaError};
pub use handler::{FnStepHandler, IdempotencyKey, StepContext, StepHandler, StepOutcome};
pub use orchestrator::{SagaOrchestrator, payload_from_value};
pub use query::{SagaQueryService, SagaStatusView};
pub use registry::{SagaDefinition, SagaDefinitionBuilder, StepDefinition, StepRegistry};
pub use retry::RetryPolicy;
pub use saga_store::{
    InMemorySagaStore, Page, PageRequest, PostgresSagaStore, SagaFilter, SagaRecord, SagaStatus,
    SagaStore, StepRecord, StepStatus, Version,
};
pub use services::{
    Fault, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
};
pub use worker::{WorkerConfig, WorkerPool};
