//! End-to-end scheduling scenarios.
//!
//! Each test wires a real orchestrator, registry, queue and pool around an
//! in-process worker factory and a scripted pipeline. Time is paused so
//! backoff delays and pipeline sleeps complete instantly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use fleet_scheduler::error::{OrchestratorError, PipelineError, WorkerError};
use fleet_scheduler::events::{drain_events, SchedulerEvent};
use fleet_scheduler::pipeline::{PipelineRequest, StepResult, StepResults, TaskPipeline};
use fleet_scheduler::registry::{Priority, ProcessingWindow, Store, StoreRegistry, StoreState};
use fleet_scheduler::resources::{ResourcePool, WorkerFactory, WorkerHandle};
use fleet_scheduler::{EventBus, Orchestrator, SchedulerConfig};
use tokio::time::Instant;

#[derive(Default)]
struct FakeWorkers {
    created: AtomicUsize,
}

#[async_trait]
impl WorkerFactory for FakeWorkers {
    async fn create(&self) -> Result<WorkerHandle, WorkerError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerHandle::new())
    }

    fn is_connected(&self, _worker: &WorkerHandle) -> bool {
        true
    }

    async fn close(&self, _worker: &WorkerHandle) -> Result<(), WorkerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Fail the first n calls, then succeed.
    FailTimes(u32),
    Panic,
}

/// Pipeline whose outcome per store is set by the test.
struct ScriptedPipeline {
    delay: Duration,
    behaviors: Mutex<HashMap<String, Behavior>>,
    api_calls: Mutex<HashMap<String, u64>>,
    calls: Mutex<HashMap<String, u32>>,
    starts: Mutex<Vec<(String, Instant)>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedPipeline {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            behaviors: Mutex::new(HashMap::new()),
            api_calls: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn set(&self, store_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(store_id.to_string(), behavior);
    }

    fn report_api_calls(&self, store_id: &str, calls: u64) {
        self.api_calls
            .lock()
            .unwrap()
            .insert(store_id.to_string(), calls);
    }

    fn calls(&self, store_id: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(store_id)
            .copied()
            .unwrap_or(0)
    }

    fn start_order(&self) -> Vec<String> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn started_at(&self, store_id: &str) -> Instant {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == store_id)
            .map(|(_, at)| *at)
            .expect("store was started")
    }
}

#[async_trait]
impl TaskPipeline for ScriptedPipeline {
    async fn execute(&self, request: PipelineRequest<'_>) -> Result<StepResults, PipelineError> {
        let store_id = request.store_id.to_string();
        assert!(!request.workers.is_empty(), "pipeline ran without workers");

        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(store_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.starts
            .lock()
            .unwrap()
            .push((store_id.clone(), Instant::now()));

        let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&store_id)
            .copied()
            .unwrap_or(Behavior::Succeed);
        let api_calls = self
            .api_calls
            .lock()
            .unwrap()
            .get(&store_id)
            .copied()
            .unwrap_or(0);

        let mut steps = StepResults::new();
        match behavior {
            Behavior::Panic => panic!("pipeline exploded for {}", store_id),
            Behavior::Fail => {
                steps.insert(
                    "extract".into(),
                    StepResult::failed("upstream 503", 5)
                        .with_data(serde_json::json!({"api_calls": api_calls})),
                );
            }
            Behavior::FailTimes(n) if call <= n => {
                steps.insert("extract".into(), StepResult::failed("upstream 503", 5));
            }
            Behavior::FailTimes(_) | Behavior::Succeed => {
                steps.insert(
                    "extract".into(),
                    StepResult::ok(
                        serde_json::json!({"records": 3, "api_calls": api_calls}),
                        5,
                    ),
                );
                steps.insert("publish".into(), StepResult::ok(serde_json::json!({}), 1));
            }
        }
        Ok(steps)
    }
}

fn registry_with(stores: &[(&str, Priority)]) -> Arc<StoreRegistry> {
    let registry = StoreRegistry::in_memory();
    for (id, priority) in stores {
        registry
            .register(Store::new(*id, format!("Store {}", id), *priority))
            .unwrap();
    }
    Arc::new(registry)
}

fn orchestrator(
    config: SchedulerConfig,
    registry: Arc<StoreRegistry>,
    pipeline: Arc<ScriptedPipeline>,
) -> Orchestrator {
    Orchestrator::new(
        config,
        registry,
        Arc::new(FakeWorkers::default()),
        pipeline,
    )
    .unwrap()
}

/// Waits until `store_id` has been started by the loop.
async fn wait_for_start(rx: &mut tokio::sync::broadcast::Receiver<SchedulerEvent>, store_id: &str) {
    loop {
        match rx.recv().await.unwrap() {
            SchedulerEvent::StoreProcessingStarted { store_id: id, .. } if id == store_id => {
                return
            }
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bounded_by_pool_and_limit() {
    let registry = registry_with(&[
        ("h1", Priority::High),
        ("h2", Priority::High),
        ("l1", Priority::Low),
    ]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(2)));
    let config = SchedulerConfig::default()
        .with_pool_size(2)
        .with_max_concurrent_stores(2);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    assert_eq!(pipeline.peak.load(Ordering::SeqCst), 2);
    assert_eq!(report.total_stores, 3);
    assert_eq!(report.completed_stores, 3);
    assert_eq!(report.failed_stores, 0);
    assert!(report.skipped_stores.is_empty());
    assert_eq!(report.success_rate, 100.0);

    // The low tier waits for a high store to release its worker.
    let order = pipeline.start_order();
    assert_eq!(order[2], "l1");
    let low_start = pipeline.started_at("l1");
    assert!(low_start >= pipeline.started_at("h1") + Duration::from_secs(2));

    let stats = orch.pool().usage_stats().await;
    assert_eq!(stats.pool.allocated, 0);
    assert_eq!(stats.pool.available, 2);
    for id in ["h1", "h2", "l1"] {
        assert!(registry.get(id).unwrap().metadata.last_processed_at.is_some());
    }
    assert!(!orch.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_at_threshold() {
    let registry = registry_with(&[("flaky", Priority::Medium), ("steady", Priority::Medium)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("flaky", Behavior::Fail);
    let config = SchedulerConfig::default()
        .with_backoff_ladder(vec![Duration::from_millis(100); 3])
        .with_quarantine_threshold(3);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());
    let mut rx = orch.subscribe();

    let report = orch.start_processing().await.unwrap();

    // Quarantined on the third failure; the remaining retry is not used.
    assert_eq!(pipeline.calls("flaky"), 3);
    let store = registry.get("flaky").unwrap();
    assert_eq!(store.state(), StoreState::Quarantined);
    assert_eq!(store.metadata.failure_count, 3);
    let reason = store.metadata.quarantine_reason.as_deref().unwrap();
    assert!(reason.contains("3 failures"), "reason: {}", reason);
    assert!(!reason.contains("consecutive"));

    assert_eq!(report.completed_stores, 1);
    assert_eq!(report.failed_stores, 1);
    assert_eq!(report.total_attempts, 4);
    assert_eq!(report.failures[0].store_id, "flaky");
    assert_eq!(report.failures[0].attempts, 3);

    let events = drain_events(&mut rx);
    let quarantined: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::StoreQuarantined { .. }))
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert!(matches!(
        quarantined[0],
        SchedulerEvent::StoreQuarantined { store_id, failure_count: 3, .. } if store_id == "flaky"
    ));
    assert_eq!(registry.quarantined_stores().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_below_threshold_keeps_store_active() {
    let registry = registry_with(&[("flaky", Priority::High)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("flaky", Behavior::Fail);
    let config = SchedulerConfig::default()
        .with_backoff_ladder(vec![Duration::from_secs(60)])
        .with_quarantine_threshold(3);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());
    let mut rx = orch.subscribe();

    let report = orch.start_processing().await.unwrap();

    assert_eq!(pipeline.calls("flaky"), 2);
    let store = registry.get("flaky").unwrap();
    assert_eq!(store.state(), StoreState::Active);
    assert_eq!(store.metadata.failure_count, 2);
    assert_eq!(report.failed_stores, 1);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::QueueMaxRetriesExceeded { attempts: 1, .. }
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::StoreQuarantined { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_quarantines_when_enabled() {
    let registry = registry_with(&[("flaky", Priority::High)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("flaky", Behavior::Fail);
    let config = SchedulerConfig::default()
        .with_backoff_ladder(vec![Duration::from_secs(1)])
        .with_quarantine_threshold(10)
        .with_quarantine_on_retry_exhaustion(true);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    orch.start_processing().await.unwrap();

    let store = registry.get("flaky").unwrap();
    assert_eq!(store.state(), StoreState::Quarantined);
    assert_eq!(store.metadata.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_released_store_runs_again() {
    let registry = registry_with(&[("flaky", Priority::Low)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("flaky", Behavior::Fail);
    let config = SchedulerConfig::default()
        .with_backoff_ladder(vec![])
        .with_quarantine_threshold(1);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    orch.start_processing().await.unwrap();
    assert_eq!(registry.get("flaky").unwrap().state(), StoreState::Quarantined);

    // Quarantined stores are not picked up.
    let report = orch.start_processing().await.unwrap();
    assert_eq!(report.total_stores, 0);
    assert_eq!(pipeline.calls("flaky"), 1);

    registry.release_from_quarantine("flaky").unwrap();
    pipeline.set("flaky", Behavior::Succeed);
    assert_eq!(registry.get("flaky").unwrap().metadata.failure_count, 0);

    let report = orch.start_processing().await.unwrap();
    assert_eq!(report.completed_stores, 1);
    assert_eq!(pipeline.calls("flaky"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_backoff() {
    let registry = registry_with(&[("wobbly", Priority::Medium)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("wobbly", Behavior::FailTimes(1));
    let config = SchedulerConfig::default()
        .with_backoff_ladder(vec![Duration::from_secs(60), Duration::from_secs(300)]);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    let started = Instant::now();
    let report = orch.start_processing().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(report.completed_stores, 1);
    assert_eq!(report.total_attempts, 2);
    assert_eq!(report.results[0].attempt, 1);
    assert!(report.failures.is_empty());

    // A success does not forgive earlier failures.
    let store = registry.get("wobbly").unwrap();
    assert_eq!(store.metadata.failure_count, 1);
    assert!(store.metadata.last_processed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_pipeline_is_isolated() {
    let registry = registry_with(&[
        ("boom", Priority::High),
        ("ok1", Priority::Medium),
        ("ok2", Priority::Low),
    ]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("boom", Behavior::Panic);
    let config = SchedulerConfig::default().with_backoff_ladder(vec![]);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    assert_eq!(report.total_stores, 3);
    assert_eq!(report.completed_stores, 2);
    assert_eq!(report.failed_stores, 1);
    let failure = &report.failures[0];
    assert_eq!(failure.store_id, "boom");
    assert!(failure.errors[0].contains("pipeline exploded for boom"));

    assert_eq!(registry.get("boom").unwrap().metadata.failure_count, 1);
    let stats = orch.pool().usage_stats().await;
    assert_eq!(stats.pool.allocated, 0);
    assert!(stats.allocations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_processing_skips_queued_stores() {
    let registry = registry_with(&[
        ("a", Priority::High),
        ("b", Priority::Medium),
        ("c", Priority::Low),
    ]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(5)));
    let config = SchedulerConfig::default().with_max_concurrent_stores(1);
    let orch = Arc::new(orchestrator(config, registry, pipeline.clone()));
    let mut rx = orch.subscribe();

    let run = tokio::spawn({
        let orch = Arc::clone(&orch);
        async move { orch.start_processing().await }
    });
    wait_for_start(&mut rx, "a").await;
    while pipeline.calls("a") == 0 {
        tokio::task::yield_now().await;
    }

    let status = orch.status().await;
    assert!(status.is_running);
    assert_eq!(status.active_store_ids, vec!["a".to_string()]);
    assert_eq!(status.queue_length, 2);
    assert_eq!(status.resources.pool.allocated, 1);

    // A second run cannot start while this one is in progress.
    assert!(matches!(
        orch.start_processing().await,
        Err(OrchestratorError::AlreadyRunning)
    ));

    orch.stop_processing().await;
    assert!(!orch.is_running());

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.completed_stores, 1);
    assert_eq!(report.total_stores, 3);
    assert_eq!(report.skipped_stores, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(pipeline.start_order(), vec!["a".to_string()]);
    assert!(orch.queue().is_empty());

    let status = orch.status().await;
    assert!(!status.is_running);
    assert_eq!(status.completed_count, 1);
    assert!(status.active_store_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_stops_new_work() {
    let registry = registry_with(&[
        ("a", Priority::High),
        ("b", Priority::Medium),
        ("c", Priority::Low),
    ]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(1)));
    let config = SchedulerConfig::default()
        .with_max_concurrent_stores(1)
        .with_run_timeout(Duration::from_millis(1500));
    let orch = orchestrator(config, registry, pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    // "b" was already in flight at the deadline and runs to completion.
    assert_eq!(report.completed_stores, 2);
    assert_eq!(report.skipped_stores, vec!["c".to_string()]);
    assert_eq!(pipeline.calls("c"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ineligible_stores_are_not_scheduled() {
    let registry = registry_with(&[
        ("open", Priority::Medium),
        ("off", Priority::Medium),
        ("closed", Priority::Medium),
    ]);
    registry.disable("off").unwrap();

    let today = Utc::now().weekday().num_days_from_sunday() as u8;
    let other_days: Vec<u8> = (0..7).filter(|d| *d != today).collect();
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    let config = SchedulerConfig::default().with_processing_window(
        "closed",
        ProcessingWindow::new("00:00", "23:59").with_days(other_days),
    );
    let orch = orchestrator(config, registry, pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    assert_eq!(report.total_stores, 1);
    assert_eq!(pipeline.start_order(), vec!["open".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reported_api_calls_cross_burst_once() {
    let registry = registry_with(&[("big", Priority::High), ("small", Priority::Low)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.report_api_calls("big", 65);
    pipeline.report_api_calls("small", 10);
    let config = SchedulerConfig::default()
        .with_max_concurrent_stores(1)
        .with_api_rate_limit(60, 10);
    let orch = orchestrator(config, registry, pipeline);
    let mut rx = orch.subscribe();

    let report = orch.start_processing().await.unwrap();

    assert_eq!(report.total_api_calls(), 75);
    let throttles: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::ApiThrottled { .. }))
        .collect();
    assert_eq!(throttles.len(), 1);

    let stats = orch.pool().usage_stats().await;
    assert_eq!(stats.api.requests_this_window, 75);
    assert_eq!(stats.throttle_events, 1);
}

#[tokio::test(start_paused = true)]
async fn test_burst_accounting_on_pool() {
    let config = SchedulerConfig::default().with_api_rate_limit(60, 10);
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let pool = ResourcePool::new(Arc::new(FakeWorkers::default()), &config, events);

    pool.record_api_request(65);
    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(pool.usage_stats().await.api.burst_used, 5);

    pool.record_api_request(10);
    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        SchedulerEvent::ApiThrottled {
            requests_this_window: 75,
            burst_used: 15,
            burst_limit: 10,
        }
    ));

    // The window resets after a minute.
    tokio::time::advance(Duration::from_secs(61)).await;
    let grant = pool.acquire_api_quota("s1", 20).await;
    assert_eq!(grant.granted, 20);
    assert!(!grant.from_burst);
}

#[tokio::test(start_paused = true)]
async fn test_api_calls_from_failed_steps_are_charged() {
    let registry = registry_with(&[("flaky", Priority::High)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(10)));
    pipeline.set("flaky", Behavior::Fail);
    pipeline.report_api_calls("flaky", 40);
    let config = SchedulerConfig::default().with_backoff_ladder(vec![]);
    let orch = orchestrator(config, registry, pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    assert_eq!(pipeline.calls("flaky"), 1);
    assert_eq!(report.failed_stores, 1);
    assert_eq!(report.total_api_calls(), 40);
    let stats = orch.pool().usage_stats().await;
    assert_eq!(stats.api.requests_this_window, 40);
}

#[tokio::test(start_paused = true)]
async fn test_resource_timeout_counts_as_failure() {
    let registry = registry_with(&[("a", Priority::High), ("b", Priority::Low)]);
    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(10)));
    let config = SchedulerConfig::default()
        .with_pool_size(1)
        .with_max_concurrent_stores(2)
        .with_acquire_timeout(Duration::from_secs(1))
        .with_backoff_ladder(vec![]);
    let orch = orchestrator(config, registry.clone(), pipeline.clone());

    let report = orch.start_processing().await.unwrap();

    // One store holds the only worker for 10s; the other gives up after 1s.
    assert_eq!(report.total_stores, 2);
    assert_eq!(report.completed_stores, 1);
    assert_eq!(report.failed_stores, 1);
    let failure = &report.failures[0];
    assert_eq!(failure.attempts, 1);
    assert!(
        failure.errors[0].contains("Resource error: Timed out after 1s"),
        "errors: {:?}",
        failure.errors
    );

    let starved = registry.get(&failure.store_id).unwrap();
    assert_eq!(starved.metadata.failure_count, 1);
    assert_eq!(pipeline.calls(&failure.store_id), 0);
    assert_eq!(orch.pool().usage_stats().await.pool.allocated, 0);
}
