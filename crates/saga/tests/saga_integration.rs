//! Integration tests for saga orchestration against the in-memory store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::order_fulfillment::{
    self, OrderServices, STEP_CHARGE_PAYMENT, STEP_RESERVE_INVENTORY, STEP_SEND_CONFIRMATION,
};
use saga::{
    EngineConfig, Fault, IdempotencyKey, Payload, RetryPolicy, SagaDefinition, SagaError,
    SagaFilter, SagaId, SagaOrchestrator, SagaQueryService, SagaRecord, SagaStatus, SagaStore,
    StepContext, StepHandler, StepOutcome, StepRecord, StepRegistry, StepStatus, WorkerConfig,
    WorkerPool,
};
use saga_store::{InMemorySagaStore, Page, PageRequest, StoreError, Version};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Scripted step handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Compensate,
}

#[derive(Debug, Clone)]
struct Call {
    step: String,
    direction: Direction,
    key: String,
    attempt: u32,
}

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn record(&self, ctx: &StepContext, key: &IdempotencyKey, direction: Direction) {
        self.0.lock().unwrap().push(Call {
            step: ctx.step_name.clone(),
            direction,
            key: key.to_string(),
            attempt: ctx.attempt,
        });
    }

    fn calls(&self, direction: Direction) -> Vec<Call> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.direction == direction)
            .cloned()
            .collect()
    }

    fn steps(&self, direction: Direction) -> Vec<String> {
        self.calls(direction).into_iter().map(|c| c.step).collect()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Returns scripted outcomes in order, then succeeds.
struct ScriptedStep {
    log: CallLog,
    forward: Mutex<VecDeque<StepOutcome<Payload>>>,
    compensate: Mutex<VecDeque<StepOutcome<()>>>,
    delay: Duration,
}

impl ScriptedStep {
    fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            forward: Mutex::default(),
            compensate: Mutex::default(),
            delay: Duration::ZERO,
        }
    }

    fn forward_outcomes(self, outcomes: Vec<StepOutcome<Payload>>) -> Self {
        *self.forward.lock().unwrap() = outcomes.into();
        self
    }

    fn compensate_outcomes(self, outcomes: Vec<StepOutcome<()>>) -> Self {
        *self.compensate.lock().unwrap() = outcomes.into();
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    async fn forward(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        _payload: &Payload,
    ) -> StepOutcome<Payload> {
        self.log.record(ctx, key, Direction::Forward);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.forward.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            let mut output = Payload::new();
            output.insert("step".into(), serde_json::json!(ctx.step_name));
            StepOutcome::Success(output)
        })
    }

    async fn compensate(
        &self,
        ctx: &StepContext,
        key: &IdempotencyKey,
        captured_output: &Payload,
    ) -> StepOutcome<()> {
        self.log.record(ctx, key, Direction::Compensate);
        assert_eq!(captured_output["step"], serde_json::json!(ctx.step_name));

        let scripted = self.compensate.lock().unwrap().pop_front();
        scripted.unwrap_or(StepOutcome::Success(()))
    }
}

// ---------------------------------------------------------------------------
// Store that loses writes on demand
// ---------------------------------------------------------------------------

/// Loses one update as if the process died before persisting it.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemorySagaStore,
    /// Updates to let through before one is lost.
    failure: Arc<Mutex<Option<usize>>>,
}

impl FlakyStore {
    fn fail_update_after(&self, passes: usize) {
        *self.failure.lock().unwrap() = Some(passes);
    }

    fn fail_next_update(&self) {
        self.fail_update_after(0);
    }

    fn take_failure(&self) -> bool {
        let mut failure = self.failure.lock().unwrap();
        match *failure {
            Some(0) => {
                *failure = None;
                true
            }
            Some(n) => {
                *failure = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl SagaStore for FlakyStore {
    async fn insert(&self, saga: &SagaRecord) -> saga_store::Result<()> {
        self.inner.insert(saga).await
    }

    async fn update(
        &self,
        saga: &SagaRecord,
        step: Option<&StepRecord>,
    ) -> saga_store::Result<Version> {
        if self.take_failure() {
            return Err(StoreError::InvalidWrite("injected crash".to_string()));
        }
        self.inner.update(saga, step).await
    }

    async fn get(&self, saga_id: SagaId) -> saga_store::Result<Option<SagaRecord>> {
        self.inner.get(saga_id).await
    }

    async fn get_steps(&self, saga_id: SagaId) -> saga_store::Result<Vec<StepRecord>> {
        self.inner.get_steps(saga_id).await
    }

    async fn list(
        &self,
        filter: &SagaFilter,
        page: PageRequest,
    ) -> saga_store::Result<Page<SagaRecord>> {
        self.inner.list(filter, page).await
    }

    async fn list_resumable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> saga_store::Result<Vec<SagaId>> {
        self.inner.list_resumable(stale_before, limit).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const SAGA_TYPE: &str = "Linear";

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_forward_retry(RetryPolicy::immediate(3))
        .with_compensation_retry(RetryPolicy::immediate(3))
        .with_step_timeout(Duration::from_secs(5))
}

fn linear_definition(steps: Vec<(&str, ScriptedStep)>) -> SagaDefinition {
    steps
        .into_iter()
        .fold(SagaDefinition::builder(SAGA_TYPE), |builder, (name, step)| {
            builder.step(name, Arc::new(step))
        })
        .build()
        .unwrap()
}

fn orchestrator_with<S: SagaStore>(
    store: S,
    definition: SagaDefinition,
    config: EngineConfig,
) -> SagaOrchestrator<S> {
    let mut registry = StepRegistry::new();
    registry.register(definition).unwrap();
    SagaOrchestrator::new(store, registry, config)
}

fn orchestrator(definition: SagaDefinition) -> SagaOrchestrator<InMemorySagaStore> {
    orchestrator_with(InMemorySagaStore::new(), definition, fast_config())
}

fn plain_steps(log: &CallLog, names: &[&'static str]) -> Vec<(&'static str, ScriptedStep)> {
    names
        .iter()
        .map(|name| (*name, ScriptedStep::new(log)))
        .collect()
}

fn statuses(steps: &[StepRecord]) -> Vec<(&str, StepStatus)> {
    steps
        .iter()
        .map(|s| (s.step_name.as_str(), s.status))
        .collect()
}

struct OrderHarness {
    services: OrderServices,
    orchestrator: SagaOrchestrator<InMemorySagaStore>,
    query: SagaQueryService<InMemorySagaStore>,
}

impl OrderHarness {
    fn new() -> Self {
        let services = OrderServices::new();
        let mut registry = StepRegistry::new();
        order_fulfillment::register(&mut registry, &services).unwrap();

        let orchestrator =
            SagaOrchestrator::new(InMemorySagaStore::new(), registry, fast_config());
        let query = SagaQueryService::new(orchestrator.clone());

        Self {
            services,
            orchestrator,
            query,
        }
    }

    async fn execute(&self) -> SagaId {
        self.orchestrator
            .execute(
                order_fulfillment::SAGA_TYPE,
                order_fulfillment::payload("O1", "X", 2, 49.98),
            )
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Forward execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_runs_every_step_once() {
    let log = CallLog::default();
    let orchestrator = orchestrator(linear_definition(plain_steps(&log, &["A", "B", "C"])));

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let query = SagaQueryService::new(orchestrator.clone());
    let view = query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Completed);
    // insert + one write per step + completion
    assert_eq!(view.instance.version, Version::new(5));
    assert_eq!(
        statuses(&view.steps),
        vec![
            ("A", StepStatus::Completed),
            ("B", StepStatus::Completed),
            ("C", StepStatus::Completed)
        ]
    );
    assert_eq!(view.step("B").unwrap().captured_output.as_ref().unwrap()["step"], "B");

    assert_eq!(log.steps(Direction::Forward), vec!["A", "B", "C"]);
    assert!(log.calls(Direction::Compensate).is_empty());
}

#[tokio::test]
async fn test_fatal_step_compensates_completed_steps_in_reverse() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log)),
        ("B", ScriptedStep::new(&log)),
        (
            "C",
            ScriptedStep::new(&log).forward_outcomes(vec![StepOutcome::fatal("rejected")]),
        ),
        ("D", ScriptedStep::new(&log)),
    ]);
    let orchestrator = orchestrator(definition);

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let query = SagaQueryService::new(orchestrator.clone());
    let view = query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Compensated);
    assert_eq!(view.instance.version, Version::new(7));
    assert!(view.instance.failure_reason.as_deref().unwrap().contains("rejected"));
    assert_eq!(
        statuses(&view.steps),
        vec![
            ("A", StepStatus::Compensated),
            ("B", StepStatus::Compensated),
            ("C", StepStatus::Failed)
        ]
    );
    assert_eq!(view.step("C").unwrap().failure_reason.as_deref(), Some("rejected"));

    assert_eq!(log.steps(Direction::Forward), vec!["A", "B", "C"]);
    assert_eq!(log.steps(Direction::Compensate), vec!["B", "A"]);
}

#[tokio::test]
async fn test_fatal_first_step_compensates_nothing() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        (
            "A",
            ScriptedStep::new(&log).forward_outcomes(vec![StepOutcome::fatal("nope")]),
        ),
        ("B", ScriptedStep::new(&log)),
    ]);
    let orchestrator = orchestrator(definition);

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let status = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Compensated);
    assert!(log.calls(Direction::Compensate).is_empty());
    assert_eq!(log.steps(Direction::Forward), vec!["A"]);
}

#[tokio::test]
async fn test_resume_of_terminal_saga_is_noop() {
    let log = CallLog::default();
    let orchestrator = orchestrator(linear_definition(plain_steps(&log, &["A", "B"])));
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let calls_before = log.len();
    let version_before = orchestrator.store().get(saga_id).await.unwrap().unwrap().version;

    for _ in 0..3 {
        assert_eq!(
            orchestrator.resume(saga_id).await.unwrap(),
            SagaStatus::Completed
        );
    }

    assert_eq!(log.len(), calls_before);
    let saga = orchestrator.store().get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.version, version_before);
}

#[tokio::test]
async fn test_retryable_failure_is_retried_with_same_key() {
    let log = CallLog::default();
    let definition = linear_definition(vec![(
        "A",
        ScriptedStep::new(&log).forward_outcomes(vec![
            StepOutcome::retryable("busy"),
            StepOutcome::retryable("busy"),
        ]),
    )]);
    let orchestrator = orchestrator(definition);

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let (saga, steps) = saga_store::SagaStoreExt::load(orchestrator.store(), saga_id)
        .await
        .unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(steps[0].attempt_count, 3);
    assert!(steps[0].failure_reason.is_none());

    let calls = log.calls(Direction::Forward);
    assert_eq!(calls.iter().map(|c| c.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(calls.iter().all(|c| c.key == calls[0].key));
    assert_eq!(calls[0].key, format!("{saga_id}/A/1"));
}

#[tokio::test]
async fn test_exhausted_retries_become_fatal() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log)),
        (
            "B",
            ScriptedStep::new(&log).forward_outcomes(vec![
                StepOutcome::retryable("busy"),
                StepOutcome::retryable("busy"),
                StepOutcome::retryable("busy"),
            ]),
        ),
    ]);
    let orchestrator = orchestrator(definition);

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let steps = orchestrator.store().get_steps(saga_id).await.unwrap();
    assert_eq!(
        statuses(&steps),
        vec![("A", StepStatus::Compensated), ("B", StepStatus::Failed)]
    );
    assert_eq!(steps[1].attempt_count, 3);
    assert!(
        steps[1]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("gave up after 3 attempts")
    );
    assert_eq!(log.steps(Direction::Compensate), vec!["A"]);
}

#[tokio::test]
async fn test_step_timeout_counts_as_retryable() {
    let log = CallLog::default();
    let definition = SagaDefinition::builder(SAGA_TYPE)
        .step("A", Arc::new(ScriptedStep::new(&log)))
        .step_with_timeout(
            "B",
            Arc::new(ScriptedStep::new(&log).delay(Duration::from_millis(500))),
            Duration::from_millis(20),
        )
        .build()
        .unwrap();
    let orchestrator = orchestrator_with(
        InMemorySagaStore::new(),
        definition,
        fast_config().with_forward_retry(RetryPolicy::immediate(2)),
    );

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let steps = orchestrator.store().get_steps(saga_id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].attempt_count, 2);
    assert!(steps[1].failure_reason.as_deref().unwrap().contains("timed out"));

    let saga = orchestrator.store().get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_deadline_exceeded_compensates() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        (
            "A",
            ScriptedStep::new(&log).delay(Duration::from_millis(100)),
        ),
        ("B", ScriptedStep::new(&log)),
    ]);
    let orchestrator = orchestrator_with(
        InMemorySagaStore::new(),
        definition,
        fast_config().with_saga_deadline(Duration::from_millis(20)),
    );

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let saga = orchestrator.store().get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.failure_reason.as_deref(), Some("deadline exceeded"));
    assert!(saga.deadline_at.is_some());

    assert_eq!(log.steps(Direction::Forward), vec!["A"]);
    assert_eq!(log.steps(Direction::Compensate), vec!["A"]);
}

#[tokio::test]
async fn test_deadline_interrupts_retries_of_a_step() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log)),
        (
            "Flaky",
            ScriptedStep::new(&log)
                .forward_outcomes((0..6).map(|_| StepOutcome::retryable("busy")).collect()),
        ),
    ]);
    let config = fast_config()
        .with_forward_retry(RetryPolicy::new(
            6,
            Duration::from_millis(100),
            Duration::from_secs(1),
            1.0,
        ))
        .with_saga_deadline(Duration::from_millis(150));
    let orchestrator = orchestrator_with(InMemorySagaStore::new(), definition, config);

    let started = Instant::now();
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));

    let saga = orchestrator.store().get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.failure_reason.as_deref(), Some("deadline exceeded"));

    let flaky = &log.calls(Direction::Forward)[1..];
    assert!(!flaky.is_empty() && flaky.len() < 6);
    assert!(flaky.iter().all(|call| call.step == "Flaky"));

    // The interrupted step never completed, so only A is undone
    let steps = orchestrator.store().get_steps(saga_id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Pending);
    assert_eq!(log.steps(Direction::Compensate), vec!["A"]);
}

// ---------------------------------------------------------------------------
// Crash recovery and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_crash_before_persist_reinvokes_with_identical_key() {
    let log = CallLog::default();
    let store = FlakyStore::default();
    let orchestrator = orchestrator_with(
        store.clone(),
        linear_definition(plain_steps(&log, &["A", "B"])),
        fast_config(),
    );

    store.fail_next_update();
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    // The handler ran, but its outcome was never recorded
    let saga = store.get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Running);
    assert_eq!(saga.version, Version::first());
    assert!(store.get_steps(saga_id).await.unwrap().is_empty());

    let status = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Completed);

    let calls: Vec<Call> = log
        .calls(Direction::Forward)
        .into_iter()
        .filter(|c| c.step == "A")
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].key, calls[1].key);
    assert_eq!(store.get_steps(saga_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_crash_during_compensation_resumes_compensation() {
    let log = CallLog::default();
    let store = FlakyStore::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log)),
        ("B", ScriptedStep::new(&log)),
        (
            "C",
            ScriptedStep::new(&log).forward_outcomes(vec![StepOutcome::fatal("rejected")]),
        ),
    ]);
    let orchestrator = orchestrator_with(store.clone(), definition, fast_config());

    // A, B and C's failure are recorded; the compensation of B is lost
    store.fail_update_after(3);
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let saga = store.get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensating);
    let steps = store.get_steps(saga_id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Completed);

    let status = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Compensated);

    let compensations = log.calls(Direction::Compensate);
    let steps: Vec<&str> = compensations.iter().map(|c| c.step.as_str()).collect();
    assert_eq!(steps, vec!["B", "B", "A"]);
    assert_eq!(compensations[0].key, compensations[1].key);
    assert_eq!(log.calls(Direction::Forward).len(), 3);
}

#[tokio::test]
async fn test_concurrent_resume_advances_each_step_once() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log).delay(Duration::from_millis(10))),
        ("B", ScriptedStep::new(&log).delay(Duration::from_millis(10))),
        ("C", ScriptedStep::new(&log).delay(Duration::from_millis(10))),
    ]);
    let orchestrator = orchestrator(definition);
    let saga_id = orchestrator.submit(SAGA_TYPE, Payload::new()).await.unwrap();

    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.resume(saga_id).await }
    });
    let second = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.resume(saga_id).await }
    });
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Whichever pass lost a version check stopped; finish whatever remains
    let status = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Completed);

    let saga = orchestrator.store().get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.version, Version::new(5));
    let steps = orchestrator.store().get_steps(saga_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    // Duplicate deliveries, if any, reused the key of the original attempt
    for step in ["A", "B", "C"] {
        let keys: Vec<String> = log
            .calls(Direction::Forward)
            .into_iter()
            .filter(|c| c.step == step)
            .map(|c| c.key)
            .collect();
        assert!(!keys.is_empty());
        assert!(keys.iter().all(|k| *k == format!("{saga_id}/{step}/1")));
    }
}

#[tokio::test]
async fn test_worker_pool_recovers_interrupted_saga() {
    let log = CallLog::default();
    let store = FlakyStore::default();
    let orchestrator = orchestrator_with(
        store.clone(),
        linear_definition(plain_steps(&log, &["A", "B", "C"])),
        fast_config(),
    );

    store.fail_next_update();
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();
    assert_eq!(
        store.get(saga_id).await.unwrap().unwrap().status,
        SagaStatus::Running
    );

    let pool = WorkerPool::new(
        orchestrator.clone(),
        WorkerConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::ZERO,
            batch_size: 10,
        },
    );
    assert_eq!(pool.run_once().await.unwrap(), 1);

    let saga = store.get(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(pool.run_once().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Compensation failures and operator actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_compensation_retries_then_succeeds() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        (
            "A",
            ScriptedStep::new(&log).compensate_outcomes(vec![StepOutcome::retryable("busy")]),
        ),
        (
            "B",
            ScriptedStep::new(&log).forward_outcomes(vec![StepOutcome::fatal("rejected")]),
        ),
    ]);
    let orchestrator = orchestrator(definition);

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let steps = orchestrator.store().get_steps(saga_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Compensated);
    assert_eq!(steps[0].compensation_attempt_count, 2);

    let keys: Vec<String> = log
        .calls(Direction::Compensate)
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(keys, vec![format!("{saga_id}/A/1/compensate"); 2]);
}

#[tokio::test]
async fn test_compensation_failure_waits_for_operator() {
    let log = CallLog::default();
    let definition = linear_definition(vec![
        ("A", ScriptedStep::new(&log)),
        (
            "B",
            ScriptedStep::new(&log).compensate_outcomes(vec![StepOutcome::fatal("locked")]),
        ),
        (
            "C",
            ScriptedStep::new(&log).forward_outcomes(vec![StepOutcome::fatal("rejected")]),
        ),
    ]);
    let orchestrator = orchestrator(definition);
    let query = SagaQueryService::new(orchestrator.clone());

    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    let view = query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Failed);
    assert_eq!(
        statuses(&view.steps),
        vec![
            ("A", StepStatus::Completed),
            ("B", StepStatus::CompensationFailed),
            ("C", StepStatus::Failed)
        ]
    );
    // Earlier steps are not compensated past the failure
    assert_eq!(log.steps(Direction::Compensate), vec!["B"]);

    // Not retried automatically
    assert_eq!(orchestrator.resume(saga_id).await.unwrap(), SagaStatus::Failed);
    assert_eq!(log.steps(Direction::Compensate), vec!["B"]);

    let status = query.retry_failed_saga(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Compensated);

    let view = query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.step("B").unwrap().status, StepStatus::Compensated);
    assert_eq!(view.step("B").unwrap().generation, 2);
    assert_eq!(view.step("A").unwrap().status, StepStatus::Compensated);
    assert_eq!(log.steps(Direction::Compensate), vec!["B", "B", "A"]);

    let retry_key = &log.calls(Direction::Compensate)[1].key;
    assert_eq!(*retry_key, format!("{saga_id}/B/2/compensate"));
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_step() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let log = CallLog::default();

    let mut registry = StepRegistry::new();
    registry
        .register_step(SAGA_TYPE, "A", Arc::new(ScriptedStep::new(&log)))
        .unwrap();
    registry
        .register_fn(
            SAGA_TYPE,
            "B",
            {
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                move |_ctx: StepContext, _key: IdempotencyKey, payload: Payload| {
                    let entered = Arc::clone(&entered);
                    let release = Arc::clone(&release);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        StepOutcome::Success(payload)
                    }
                }
            },
            |_, _, _| async { StepOutcome::Success(()) },
        )
        .unwrap();

    let orchestrator = SagaOrchestrator::new(InMemorySagaStore::new(), registry, fast_config());
    let query = SagaQueryService::new(orchestrator.clone());
    let saga_id = orchestrator.submit(SAGA_TYPE, Payload::new()).await.unwrap();

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.resume(saga_id).await }
    });
    entered.notified().await;

    let status = query.cancel_saga(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Compensated);

    release.notify_one();
    let abandoned = running.await.unwrap().unwrap();
    assert_eq!(abandoned, SagaStatus::Compensated);

    let view = query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(statuses(&view.steps), vec![("A", StepStatus::Compensated)]);
    assert_eq!(log.steps(Direction::Compensate), vec!["A"]);
}

#[tokio::test]
async fn test_operator_actions_check_state() {
    let log = CallLog::default();
    let orchestrator = orchestrator(linear_definition(plain_steps(&log, &["A"])));
    let query = SagaQueryService::new(orchestrator.clone());
    let saga_id = orchestrator.execute(SAGA_TYPE, Payload::new()).await.unwrap();

    assert!(matches!(
        query.cancel_saga(saga_id).await,
        Err(SagaError::InvalidState { actual: SagaStatus::Completed, .. })
    ));
    assert!(matches!(
        query.retry_failed_saga(saga_id).await,
        Err(SagaError::InvalidState { actual: SagaStatus::Completed, .. })
    ));
    assert!(matches!(
        query.cancel_saga(SagaId::new()).await,
        Err(SagaError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Submission and queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_submissions_write_nothing() {
    let harness = OrderHarness::new();

    let unknown = harness
        .orchestrator
        .execute("Refund", order_fulfillment::payload("O1", "X", 1, 1.0))
        .await;
    assert!(matches!(unknown, Err(SagaError::UnknownSagaType(_))));

    let mut incomplete = order_fulfillment::payload("O1", "X", 1, 1.0);
    incomplete.remove("sku");
    let invalid = harness
        .orchestrator
        .execute(order_fulfillment::SAGA_TYPE, incomplete)
        .await;
    assert!(matches!(invalid, Err(SagaError::Validation(ref m)) if m.contains("sku")));

    assert_eq!(harness.orchestrator.store().saga_count().await, 0);
    assert_eq!(harness.services.inventory.reserve_calls(), 0);
}

#[tokio::test]
async fn test_list_sagas_filters_and_pages() {
    let harness = OrderHarness::new();
    for _ in 0..3 {
        harness.execute().await;
    }
    harness
        .services
        .payment
        .set_fail_on_charge(Some(Fault::fatal("card_declined")));
    let declined = harness.execute().await;

    let completed = harness
        .query
        .list_sagas(
            &SagaFilter::new().status(SagaStatus::Completed),
            PageRequest::new(0, 2),
        )
        .await
        .unwrap();
    assert_eq!(completed.total, 3);
    assert_eq!(completed.items.len(), 2);
    assert!(completed.has_more());

    let rest = harness
        .query
        .list_sagas(
            &SagaFilter::new().status(SagaStatus::Completed),
            PageRequest::new(2, 2),
        )
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 1);
    assert!(!rest.has_more());

    let compensated = harness
        .query
        .list_sagas(
            &SagaFilter::new()
                .saga_type(order_fulfillment::SAGA_TYPE)
                .status(SagaStatus::Compensated),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(compensated.total, 1);
    assert_eq!(compensated.items[0].id, declined);

    let none = harness
        .query
        .list_sagas(&SagaFilter::new().saga_type("Refund"), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(none.total, 0);
}

// ---------------------------------------------------------------------------
// Order fulfillment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_order_fulfillment_completes() {
    let harness = OrderHarness::new();
    harness.services.inventory.set_stock("X", 10);

    let saga_id = harness.execute().await;

    let view = harness.query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Completed);
    assert_eq!(
        statuses(&view.steps),
        vec![
            (STEP_RESERVE_INVENTORY, StepStatus::Completed),
            (STEP_CHARGE_PAYMENT, StepStatus::Completed),
            (STEP_SEND_CONFIRMATION, StepStatus::Completed)
        ]
    );

    assert_eq!(harness.services.inventory.stock("X"), Some(8));
    assert_eq!(harness.services.payment.payment_count(), 1);
    assert_eq!(harness.services.notification.sent().len(), 1);

    let reservation = view.step(STEP_RESERVE_INVENTORY).unwrap();
    let reservation_id = reservation.captured_output.as_ref().unwrap()["reservationId"]
        .as_str()
        .unwrap();
    assert!(harness.services.inventory.has_reservation(reservation_id));
}

#[tokio::test]
async fn test_order_fulfillment_card_declined_is_compensated() {
    let harness = OrderHarness::new();
    harness.services.inventory.set_stock("X", 10);
    harness
        .services
        .payment
        .set_fail_on_charge(Some(Fault::fatal("card_declined")));

    let saga_id = harness.execute().await;

    let view = harness.query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Compensated);
    assert_eq!(
        statuses(&view.steps),
        vec![
            (STEP_RESERVE_INVENTORY, StepStatus::Compensated),
            (STEP_CHARGE_PAYMENT, StepStatus::Failed)
        ]
    );
    assert_eq!(
        view.step(STEP_CHARGE_PAYMENT)
            .unwrap()
            .failure_reason
            .as_deref(),
        Some("card_declined")
    );

    // Only the reservation was undone
    assert_eq!(harness.services.inventory.release_calls(), 1);
    assert_eq!(harness.services.inventory.reservation_count(), 0);
    assert_eq!(harness.services.inventory.stock("X"), Some(10));
    assert_eq!(harness.services.payment.refund_count(), 0);
    assert!(harness.services.notification.sent().is_empty());
}

#[tokio::test]
async fn test_order_fulfillment_failed_release_needs_retry() {
    let harness = OrderHarness::new();
    harness
        .services
        .payment
        .set_fail_on_charge(Some(Fault::fatal("card_declined")));
    harness
        .services
        .inventory
        .set_fail_on_release(Some(Fault::fatal("warehouse_locked")));

    let saga_id = harness.execute().await;

    let view = harness.query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Failed);
    let reservation = view.step(STEP_RESERVE_INVENTORY).unwrap();
    assert_eq!(reservation.status, StepStatus::CompensationFailed);
    assert_eq!(reservation.failure_reason.as_deref(), Some("warehouse_locked"));
    assert!(view.instance.failure_reason.is_some());

    assert_eq!(
        harness.orchestrator.resume(saga_id).await.unwrap(),
        SagaStatus::Failed
    );
    assert_eq!(harness.services.inventory.release_calls(), 1);
    assert_eq!(harness.services.inventory.reservation_count(), 1);

    harness.services.inventory.set_fail_on_release(None);
    let status = harness.query.retry_failed_saga(saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Compensated);
    assert_eq!(harness.services.inventory.reservation_count(), 0);
}

#[tokio::test]
async fn test_order_fulfillment_out_of_stock() {
    let harness = OrderHarness::new();
    harness.services.inventory.set_stock("X", 1);

    let saga_id = harness.execute().await;

    let view = harness.query.get_saga_status(saga_id).await.unwrap();
    assert_eq!(view.instance.status, SagaStatus::Compensated);
    assert_eq!(
        statuses(&view.steps),
        vec![(STEP_RESERVE_INVENTORY, StepStatus::Failed)]
    );
    assert_eq!(harness.services.payment.payment_count(), 0);
}
