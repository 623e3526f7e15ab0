//! Per-store processing unit.
//!
//! [`StoreProcessor::process_store`] is the failure-isolation boundary: any
//! resource or pipeline error is turned into a failed [`ProcessingResult`]
//! and recorded against the store; nothing propagates to the scheduling
//! loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{PoolError, ProcessingError};
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;
use crate::pipeline::{PipelineRequest, ProcessingResult, StepResults, TaskPipeline};
use crate::registry::{Store, StoreRegistry};
use crate::resources::ResourcePool;
use crate::scheduler::{QueuedEntry, RequeueOutcome, StoreQueue};

/// Settings a processing unit needs from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub workers_per_store: usize,
    pub acquire_timeout: Duration,
    pub api_quota_per_store: u64,
    pub quarantine_threshold: u32,
    pub quarantine_on_retry_exhaustion: bool,
}

impl From<&SchedulerConfig> for ProcessorSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            workers_per_store: config.resource_units_per_store,
            acquire_timeout: config.pool.acquire_timeout(),
            api_quota_per_store: config.api_quota_per_store(),
            quarantine_threshold: config.failure_isolation.quarantine_threshold,
            quarantine_on_retry_exhaustion: config.failure_isolation.quarantine_on_retry_exhaustion,
        }
    }
}

/// Runs one store through resource acquisition, the pipeline and result
/// bookkeeping. Cheap to clone; every unit of work gets its own copy.
#[derive(Clone)]
pub struct StoreProcessor {
    registry: Arc<StoreRegistry>,
    queue: Arc<StoreQueue>,
    pool: Arc<ResourcePool>,
    pipeline: Arc<dyn TaskPipeline>,
    events: EventBus,
    metrics: MetricsCollector,
    settings: ProcessorSettings,
}

impl StoreProcessor {
    pub fn new(
        registry: Arc<StoreRegistry>,
        queue: Arc<StoreQueue>,
        pool: Arc<ResourcePool>,
        pipeline: Arc<dyn TaskPipeline>,
        events: EventBus,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            pool,
            pipeline,
            events,
            metrics: MetricsCollector::new(),
            settings,
        }
    }

    /// Processes one dequeued store. Resources are always released before
    /// returning.
    pub async fn process_store(&self, entry: QueuedEntry) -> ProcessingResult {
        let store = entry.store;
        let attempt = entry.attempts;
        let started_at = Utc::now();
        let timer = Instant::now();

        info!(
            store_id = %store.id,
            priority = %store.priority,
            attempt = attempt + 1,
            "Processing store"
        );
        self.events.emit(SchedulerEvent::StoreProcessingStarted {
            store_id: store.id.clone(),
            attempt,
        });

        let outcome = self.run_pipeline(&store, attempt).await;

        // The allocation belongs to another unit when acquisition was refused
        // for that reason.
        let holds_allocation = !matches!(
            outcome,
            Err(ProcessingError::Resource(PoolError::AlreadyAllocated(_)))
        );
        if holds_allocation {
            self.pool.release_resources(&store.id).await;
        }

        let result = match outcome {
            Ok(steps) => {
                ProcessingResult::from_steps(&store.id, attempt, started_at, Utc::now(), &steps)
            }
            Err(e) => ProcessingResult::failed(&store.id, attempt, started_at, e.to_string()),
        };

        self.pool.record_api_request(result.api_calls());
        self.finish(&store, result, timer.elapsed())
    }

    /// Records a unit that died without producing a result. Resources must
    /// already have been released by the caller.
    pub fn record_abort(
        &self,
        store: &Store,
        attempt: u32,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> ProcessingResult {
        let error = ProcessingError::Aborted(reason.to_string());
        error!(store_id = %store.id, error = %error, "Processing unit aborted");

        let result = ProcessingResult::failed(&store.id, attempt, started_at, error.to_string());
        let elapsed = (result.ended_at - started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.finish(store, result, elapsed)
    }

    async fn run_pipeline(&self, store: &Store, attempt: u32) -> Result<StepResults, ProcessingError> {
        let workers = store
            .requested_workers()
            .unwrap_or(self.settings.workers_per_store);

        let grants = self
            .pool
            .acquire_workers(&store.id, workers, self.settings.acquire_timeout)
            .await?;

        let quota = self
            .pool
            .acquire_api_quota(&store.id, self.settings.api_quota_per_store)
            .await;
        if quota.is_partial() {
            info!(
                store_id = %store.id,
                requested = quota.requested,
                granted = quota.granted,
                "API quota exhausted, running with reduced quota"
            );
        }

        let request = PipelineRequest {
            store_id: &store.id,
            config: &store.config,
            workers: &grants,
            api_quota: quota.granted,
            attempt,
        };

        Ok(self.pipeline.execute(request).await?)
    }

    fn finish(&self, store: &Store, result: ProcessingResult, elapsed: Duration) -> ProcessingResult {
        self.metrics.record_store_processed(
            &result.status.to_string(),
            &store.priority.to_string(),
            elapsed.as_secs_f64(),
        );

        if result.is_success() {
            self.handle_success(store, &result, elapsed);
        } else {
            self.handle_failure(store, &result);
        }
        result
    }

    fn handle_success(&self, store: &Store, result: &ProcessingResult, elapsed: Duration) {
        if let Err(e) = self.registry.update_last_processed(&store.id, result.ended_at) {
            error!(store_id = %store.id, error = %e, "Failed to record last processed time");
        }

        info!(
            store_id = %store.id,
            duration_ms = elapsed.as_millis() as u64,
            steps = result.steps_total,
            "Store processed successfully"
        );
        self.events.emit(SchedulerEvent::StoreProcessingCompleted {
            store_id: store.id.clone(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    fn handle_failure(&self, store: &Store, result: &ProcessingResult) {
        let error_text = result.error_summary();

        let failure_count = match self.registry.increment_failure_count(&store.id) {
            Ok(count) => count,
            Err(e) => {
                error!(store_id = %store.id, error = %e, "Failed to record store failure");
                store.metadata.failure_count.saturating_add(1)
            }
        };

        warn!(
            store_id = %store.id,
            attempt = result.attempt + 1,
            failure_count = failure_count,
            error = %error_text,
            "Store processing failed"
        );
        self.events.emit(SchedulerEvent::StoreProcessingFailed {
            store_id: store.id.clone(),
            error: error_text,
            failure_count,
        });

        if failure_count >= self.settings.quarantine_threshold {
            let reason = format!(
                "{} failures (threshold {})",
                failure_count, self.settings.quarantine_threshold
            );
            self.quarantine(&store.id, &reason, failure_count);
            return;
        }

        let snapshot = self.registry.get(&store.id).unwrap_or_else(|| store.clone());
        if !snapshot.is_schedulable() {
            debug!(store_id = %store.id, state = %snapshot.state(), "Store no longer schedulable, not requeueing");
            return;
        }

        if let RequeueOutcome::Exhausted { attempts } = self.queue.requeue(snapshot, result.attempt) {
            if self.settings.quarantine_on_retry_exhaustion {
                let reason = format!("retries exhausted after {} attempts", attempts + 1);
                self.quarantine(&store.id, &reason, failure_count);
            }
        }
    }

    fn quarantine(&self, store_id: &str, reason: &str, failure_count: u32) {
        if let Err(e) = self.registry.quarantine_store(store_id, reason) {
            error!(store_id = %store_id, error = %e, "Failed to quarantine store");
            return;
        }

        self.metrics
            .set_quarantined_stores(self.registry.quarantined_stores().len());
        self.events.emit(SchedulerEvent::StoreQuarantined {
            store_id: store_id.to_string(),
            reason: reason.to_string(),
            failure_count,
        });
    }
}
