//! Saga definitions and the registry the orchestrator resolves them from.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::Payload;

use crate::error::{Result, SagaError};
use crate::handler::{FnStepHandler, IdempotencyKey, StepContext, StepHandler, StepOutcome};

/// One named step of a saga definition.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    /// Overrides [`EngineConfig::step_timeout`](crate::EngineConfig::step_timeout).
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// The ordered steps of a saga type.
///
/// Forward execution follows `steps` order; compensation runs in reverse.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub saga_type: String,
    /// Stamped on every instance; resuming an instance with a different
    /// version is rejected.
    pub version: u32,
    pub steps: Vec<StepDefinition>,
    /// Top-level payload fields that must be present at submission.
    pub required_fields: Vec<String>,
    /// Overrides [`EngineConfig::saga_deadline`](crate::EngineConfig::saga_deadline).
    pub deadline: Option<Duration>,
}

impl SagaDefinition {
    /// Starts building a definition for `saga_type` at version 1.
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            definition: SagaDefinition {
                saga_type: saga_type.into(),
                version: 1,
                steps: Vec::new(),
                required_fields: Vec::new(),
                deadline: None,
            },
        }
    }

    /// Looks up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Checks that a payload carries every required field.
    pub fn validate(&self, payload: &Payload) -> Result<()> {
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| !payload.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SagaError::Validation(format!(
                "{} payload is missing required fields: {}",
                self.saga_type,
                missing.join(", ")
            )))
        }
    }

    /// Rejects a definition that names the same step twice.
    pub fn check_unique_steps(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::DuplicateStep {
                    saga_type: self.saga_type.clone(),
                    step: step.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn push_step(&mut self, step: StepDefinition) -> Result<()> {
        if self.step(&step.name).is_some() {
            return Err(SagaError::DuplicateStep {
                saga_type: self.saga_type.clone(),
                step: step.name,
            });
        }
        self.steps.push(step);
        Ok(())
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    definition: SagaDefinition,
}

impl SagaDefinitionBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.definition.version = version;
        self
    }

    pub fn required_field(mut self, field: impl Into<String>) -> Self {
        self.definition.required_fields.push(field.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.definition.deadline = Some(deadline);
        self
    }

    /// Appends a step using the engine's default timeout.
    pub fn step(self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.step_with_timeout(name, handler, Option::<Duration>::None)
    }

    /// Appends a step with its own timeout.
    pub fn step_with_timeout(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
        timeout: impl Into<Option<Duration>>,
    ) -> Self {
        self.definition.steps.push(StepDefinition {
            name: name.into(),
            handler,
            timeout: timeout.into(),
        });
        self
    }

    /// Finishes the definition, rejecting duplicate step names.
    pub fn build(self) -> Result<SagaDefinition> {
        self.definition.check_unique_steps()?;
        Ok(self.definition)
    }
}

/// Registry of saga definitions, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    definitions: HashMap<String, SagaDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a whole definition, replacing any earlier one of the same type.
    ///
    /// Definitions assembled by hand are checked for duplicate step names
    /// just like built ones.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        definition.check_unique_steps()?;
        tracing::debug!(
            saga_type = %definition.saga_type,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        self.definitions
            .insert(definition.saga_type.clone(), definition);
        Ok(())
    }

    /// Appends a step to `saga_type`, creating a version 1 definition on first use.
    ///
    /// Steps execute in registration order.
    pub fn register_step(
        &mut self,
        saga_type: &str,
        step_name: &str,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let definition = self
            .definitions
            .entry(saga_type.to_string())
            .or_insert_with(|| SagaDefinition::builder(saga_type).definition);

        definition.push_step(StepDefinition {
            name: step_name.to_string(),
            handler,
            timeout: None,
        })
    }

    /// Registers a step from a pair of async closures.
    pub fn register_fn<F, FFut, C, CFut>(
        &mut self,
        saga_type: &str,
        step_name: &str,
        forward: F,
        compensate: C,
    ) -> Result<()>
    where
        F: Fn(StepContext, IdempotencyKey, Payload) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = StepOutcome<Payload>> + Send + 'static,
        C: Fn(StepContext, IdempotencyKey, Payload) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = StepOutcome<()>> + Send + 'static,
    {
        self.register_step(
            saga_type,
            step_name,
            Arc::new(FnStepHandler::new(forward, compensate)),
        )
    }

    /// Looks up the definition of `saga_type`.
    pub fn definition(&self, saga_type: &str) -> Option<&SagaDefinition> {
        self.definitions.get(saga_type)
    }

    /// Returns every registered saga type, sorted.
    pub fn saga_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
