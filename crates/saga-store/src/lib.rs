//! Durable persistence for saga instances and their step execution records.
//!
//! Every mutation is a compare-and-set on the saga's `version`, which is how
//! concurrent orchestrator workers are kept from advancing the same saga twice.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod status;
pub mod store;

pub use common::{Payload, SagaId};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::{Page, PageRequest, SagaFilter};
pub use record::{SagaRecord, StepRecord, Version};
pub use status::{SagaStatus, StepStatus};
pub use store::{SagaStore, SagaStoreExt};
