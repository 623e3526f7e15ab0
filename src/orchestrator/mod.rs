//! Top-level scheduling loop.
//!
//! The orchestrator ties the registry, queue, resource pool and injected
//! pipeline together:
//!
//! ```text
//! registry ──eligible──► queue ──dequeue (≤ max_concurrent)──► StoreProcessor
//!    ▲                     ▲                                       │
//!    │                     └──────────── requeue on failure ───────┤
//!    └──── failure count / quarantine / last processed ────────────┘
//! ```
//!
//! Units of work run as tokio tasks in a `JoinSet`. A unit that panics is
//! caught and recorded as a failure of its store; the loop keeps going.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleet_scheduler::{Orchestrator, SchedulerConfig, StoreRegistry};
//!
//! let orchestrator = Orchestrator::new(config, registry, worker_factory, pipeline)?;
//! orchestrator.initialize().await?;
//!
//! let report = orchestrator.start_processing().await?;
//! println!("{} of {} stores completed", report.completed_stores, report.total_stores);
//! ```

mod processor;
pub mod report;

pub use processor::{ProcessorSettings, StoreProcessor};
pub use report::{AggregatedReport, StoreFailure};

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, PoolError};
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;
use crate::pipeline::{ProcessingResult, TaskPipeline};
use crate::registry::{Store, StoreRegistry};
use crate::resources::{ResourcePool, ResourceUsageStats, WorkerFactory};
use crate::scheduler::{QueueStatistics, QueuedEntry, StoreQueue};

use report::ReportBuilder;

/// Snapshot returned by [`Orchestrator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub is_running: bool,
    pub active_store_ids: Vec<String>,
    pub queue_length: usize,
    /// Attempts finished in the current (or last) run.
    pub completed_count: usize,
    pub resources: ResourceUsageStats,
    pub queue: QueueStatistics,
}

#[derive(Debug, Default)]
struct RunProgress {
    active: BTreeSet<String>,
    completed: usize,
}

/// What a unit of work hands back to the loop.
struct UnitOutcome {
    store: Store,
    attempt: u32,
    started_at: DateTime<Utc>,
    result: Result<ProcessingResult, Box<dyn Any + Send>>,
}

/// Clears the running flag however a run ends.
struct RunGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Multi-tenant store scheduler.
pub struct Orchestrator {
    config: SchedulerConfig,
    registry: Arc<StoreRegistry>,
    queue: Arc<StoreQueue>,
    pool: Arc<ResourcePool>,
    processor: StoreProcessor,
    events: EventBus,
    metrics: MetricsCollector,
    running: watch::Sender<bool>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    progress: Mutex<RunProgress>,
}

impl Orchestrator {
    /// Wires an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` when the configuration is invalid.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<StoreRegistry>,
        factory: Arc<dyn WorkerFactory>,
        pipeline: Arc<dyn TaskPipeline>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let queue = Arc::new(
            StoreQueue::new(config.failure_isolation.retry_ladder(), events.clone())
                .with_sample_size(config.queue_stats_sample_size),
        );
        let pool = Arc::new(ResourcePool::new(factory, &config, events.clone()));
        let processor = StoreProcessor::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&pool),
            pipeline,
            events.clone(),
            ProcessorSettings::from(&config),
        );
        let (running, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            queue,
            pool,
            processor,
            events,
            metrics: MetricsCollector::new(),
            running,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            progress: Mutex::new(RunProgress::default()),
        })
    }

    /// Creates the worker pool and starts its background health check.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        self.pool.initialize(self.config.pool.size).await?;
        self.pool.spawn_health_check();
        self.metrics
            .set_quarantined_stores(self.registry.quarantined_stores().len());
        Ok(())
    }

    /// Runs one scheduling pass to completion and returns its report.
    ///
    /// Every eligible store is enqueued, then processed with at most
    /// `max_concurrent_stores` units in flight. The run ends once the queue
    /// is empty and nothing is in flight, or after a stop request (or the
    /// run timeout) once in-flight units finish.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if a run is in progress; pool initialization errors
    /// when the pool was not initialized yet. Per-store failures never end
    /// the run.
    pub async fn start_processing(&self) -> Result<AggregatedReport, OrchestratorError> {
        let claimed = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !claimed {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        self.stop_requested.store(false, Ordering::SeqCst);
        *self.progress() = RunProgress::default();

        match self.initialize().await {
            Ok(()) | Err(OrchestratorError::Pool(PoolError::AlreadyInitialized(_))) => {}
            Err(e) => return Err(e),
        }

        let timer = Instant::now();
        let mut report = ReportBuilder::new(Utc::now());
        let deadline = self.config.run_timeout().map(|timeout| timer + timeout);

        let eligible = self
            .registry
            .eligible_stores(Utc::now(), &self.config.processing_windows);
        let mut scheduled: Vec<String> = Vec::with_capacity(eligible.len());
        for store in eligible {
            let store_id = store.id.clone();
            if self.queue.enqueue(store, 0) {
                scheduled.push(store_id);
            }
        }

        info!(
            run_id = %report.run_id(),
            stores = scheduled.len(),
            registered = self.registry.len(),
            max_concurrent = self.config.max_concurrent_stores,
            "Starting processing run"
        );

        self.run_loop(&mut report, deadline).await;

        // Only reachable with entries left after a stop.
        let skipped: Vec<String> = self
            .queue
            .drain()
            .into_iter()
            .map(|entry| entry.store.id)
            .collect();
        if !skipped.is_empty() {
            warn!(count = skipped.len(), "Run stopped with stores still queued");
        }

        let report = report.finish(
            skipped,
            timer.elapsed(),
            self.config.api_rate_limit.requests_per_minute,
        );

        info!(
            run_id = %report.run_id,
            total = report.total_stores,
            completed = report.completed_stores,
            failed = report.failed_stores,
            skipped = report.skipped_stores.len(),
            duration_ms = report.duration_ms,
            "Processing run finished"
        );

        Ok(report)
    }

    /// Stops starting new units and waits for in-flight ones to finish.
    /// Returns immediately when no run is in progress.
    pub async fn stop_processing(&self) {
        let mut running = self.running.subscribe();
        if !*running.borrow_and_update() {
            return;
        }

        info!("Stop requested, waiting for in-flight stores");
        self.request_stop();
        // Err only if the sender is gone, i.e. the orchestrator was dropped.
        let _ = running.wait_for(|running| !*running).await;
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let (active_store_ids, completed_count) = {
            let progress = self.progress();
            (progress.active.iter().cloned().collect(), progress.completed)
        };

        OrchestratorStatus {
            is_running: self.is_running(),
            active_store_ids,
            queue_length: self.queue.len(),
            completed_count,
            resources: self.pool.usage_stats().await,
            queue: self.queue.statistics(),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Registers an event observer.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<StoreQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Closes every worker. Call after the last run.
    pub async fn shutdown(&self) {
        self.stop_processing().await;
        self.pool.shutdown().await;
    }

    async fn run_loop(&self, report: &mut ReportBuilder, deadline: Option<Instant>) {
        let max_concurrent = self.config.max_concurrent_stores;
        let mut in_flight: JoinSet<UnitOutcome> = JoinSet::new();

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) && !self.is_stop_requested() {
                warn!("Run timeout reached, no new stores will start");
                self.request_stop();
            }

            while !self.is_stop_requested() && in_flight.len() < max_concurrent {
                let Some(entry) = self.queue.dequeue() else {
                    break;
                };
                self.spawn_unit(&mut in_flight, entry);
            }

            if in_flight.is_empty() && (self.is_stop_requested() || self.queue.is_empty()) {
                break;
            }

            // Wake for whichever comes first: a finished unit, a retry
            // becoming ready while a slot is free, the run deadline, or a stop.
            let mut wake_at = None;
            if !self.is_stop_requested() {
                if in_flight.len() < max_concurrent {
                    wake_at = self.queue.next_ready_at();
                }
                wake_at = match (wake_at, deadline) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(outcome) => self.complete_unit(report, outcome).await,
                        Err(e) => error!(error = %e, "Processing unit was cancelled"),
                    }
                }
                _ = sleep_until(wake_at) => {}
                _ = self.stop_notify.notified() => {
                    debug!("Scheduling loop woken by stop request");
                }
            }
        }
    }

    fn spawn_unit(&self, in_flight: &mut JoinSet<UnitOutcome>, entry: QueuedEntry) {
        let processor = self.processor.clone();
        let store = entry.store.clone();
        let attempt = entry.attempts;

        self.progress().active.insert(store.id.clone());
        debug!(store_id = %store.id, in_flight = in_flight.len() + 1, "Starting processing unit");

        in_flight.spawn(async move {
            let started_at = Utc::now();
            let result = AssertUnwindSafe(processor.process_store(entry))
                .catch_unwind()
                .await;
            UnitOutcome {
                store,
                attempt,
                started_at,
                result,
            }
        });
    }

    async fn complete_unit(&self, report: &mut ReportBuilder, outcome: UnitOutcome) {
        let result = match outcome.result {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                self.pool.release_resources(&outcome.store.id).await;
                self.processor.record_abort(
                    &outcome.store,
                    outcome.attempt,
                    outcome.started_at,
                    &format!("panicked: {}", reason),
                )
            }
        };

        {
            let mut progress = self.progress();
            progress.active.remove(&outcome.store.id);
            progress.completed += 1;
        }
        report.record(result);
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn progress(&self) -> MutexGuard<'_, RunProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, WorkerError};
    use crate::pipeline::{PipelineRequest, StepResult, StepResults};
    use crate::registry::Priority;
    use crate::resources::WorkerHandle;
    use async_trait::async_trait;

    struct NoopWorkers;

    #[async_trait]
    impl WorkerFactory for NoopWorkers {
        async fn create(&self) -> Result<WorkerHandle, WorkerError> {
            Ok(WorkerHandle::new())
        }

        fn is_connected(&self, _worker: &WorkerHandle) -> bool {
            true
        }

        async fn close(&self, _worker: &WorkerHandle) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    struct OneStep;

    #[async_trait]
    impl TaskPipeline for OneStep {
        async fn execute(
            &self,
            _request: PipelineRequest<'_>,
        ) -> Result<StepResults, PipelineError> {
            let mut steps = StepResults::new();
            steps.insert("sync".into(), StepResult::ok(serde_json::json!({"api_calls": 2}), 1));
            Ok(steps)
        }
    }

    fn create_orchestrator(config: SchedulerConfig) -> Result<Orchestrator, OrchestratorError> {
        let registry = Arc::new(StoreRegistry::in_memory());
        Orchestrator::new(config, registry, Arc::new(NoopWorkers), Arc::new(OneStep))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = create_orchestrator(SchedulerConfig::default().with_max_concurrent_stores(0));
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static text");
        assert_eq!(panic_message(boxed.as_ref()), "static text");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        assert_eq!(panic_message(boxed.as_ref()), "owned text");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_stop_without_run_returns_immediately() {
        let orch = create_orchestrator(SchedulerConfig::default()).unwrap();
        orch.stop_processing().await;
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_empty_registry_produces_empty_report() {
        let orch = create_orchestrator(SchedulerConfig::default()).unwrap();
        let report = orch.start_processing().await.unwrap();

        assert_eq!(report.total_stores, 0);
        assert_eq!(report.total_attempts, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(orch.pool().size().await, SchedulerConfig::default().pool.size);
    }

    #[tokio::test]
    async fn test_status_after_run() {
        let orch = create_orchestrator(SchedulerConfig::default()).unwrap();
        orch.registry()
            .register(Store::new("s1", "Store 1", Priority::High))
            .unwrap();

        let report = orch.start_processing().await.unwrap();
        assert_eq!(report.completed_stores, 1);
        assert_eq!(report.total_api_calls(), 2);

        let status = orch.status().await;
        assert!(!status.is_running);
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.resources.api.requests_this_window, 2);

        orch.shutdown().await;
        assert_eq!(orch.pool().size().await, 0);
    }
}
