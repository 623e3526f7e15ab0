//! Fixed-size worker pool with API quota management.
//!
//! Workers live in an arena of slots indexed by position. Evicting a crashed
//! worker swaps the slot's handle for a freshly created one; the arena never
//! grows or shrinks, so grants keep referring to stable slot indexes.
//!
//! Every check-then-claim on slot state happens under one async mutex guard.
//! The rate limiter has its own short-lived lock and is never held across an
//! await point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, SchedulerConfig};
use crate::error::PoolError;
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;

use super::rate_limiter::{QuotaGrant, RateLimitSnapshot, RateLimiter};
use super::worker::{WorkerFactory, WorkerGrant, WorkerHandle};

/// Workers and API quota held by one store between acquire and release.
#[derive(Debug, Clone)]
pub struct ResourceAllocation {
    pub store_id: String,
    pub grants: Vec<WorkerGrant>,
    pub api_quota: u64,
    pub allocated_at: DateTime<Utc>,
    held_since: Instant,
}

/// Pool occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolUsage {
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    /// Slots whose replacement worker could not be created yet.
    pub vacant: usize,
    pub utilization_percent: f64,
}

/// One live allocation as seen by [`ResourcePool::usage_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationUsage {
    pub store_id: String,
    pub workers: usize,
    pub api_quota: u64,
    pub allocated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Point-in-time snapshot of pool and API usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsageStats {
    pub pool: PoolUsage,
    pub api: RateLimitSnapshot,
    pub allocations: Vec<AllocationUsage>,
    pub worker_crashes: u64,
    pub throttle_events: u64,
}

/// Outcome of one connectivity scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

struct WorkerSlot {
    /// `None` while the slot is vacant.
    handle: Option<WorkerHandle>,
    claimed_by: Option<String>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<WorkerSlot>,
    allocations: HashMap<String, ResourceAllocation>,
    /// Stores with an acquisition in progress.
    pending: HashSet<String>,
    initialized: bool,
}

impl PoolState {
    fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.claimed_by.is_some()).count()
    }
}

struct PoolCounters {
    worker_crashes: AtomicU64,
    throttle_events: AtomicU64,
}

/// Owner of the worker arena and the API rate limiter.
pub struct ResourcePool {
    factory: Arc<dyn WorkerFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    limiter: StdMutex<RateLimiter>,
    events: EventBus,
    metrics: MetricsCollector,
    counters: PoolCounters,
    health_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ResourcePool {
    /// Creates an empty pool. Call [`ResourcePool::initialize`] before use.
    pub fn new(factory: Arc<dyn WorkerFactory>, config: &SchedulerConfig, events: EventBus) -> Self {
        Self {
            factory,
            config: config.pool.clone(),
            state: Mutex::new(PoolState::default()),
            limiter: StdMutex::new(RateLimiter::new(&config.api_rate_limit)),
            events,
            metrics: MetricsCollector::new(),
            counters: PoolCounters {
                worker_crashes: AtomicU64::new(0),
                throttle_events: AtomicU64::new(0),
            },
            health_task: StdMutex::new(None),
        }
    }

    /// Creates `pool_size` workers up front.
    ///
    /// # Errors
    ///
    /// Any creation failure is fatal: workers created so far are closed and
    /// `PoolError::Worker` is returned.
    pub async fn initialize(&self, pool_size: usize) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Err(PoolError::AlreadyInitialized(state.slots.len()));
        }

        let mut created = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            match self.factory.create().await {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    error!(
                        created = created.len(),
                        requested = pool_size,
                        error = %e,
                        "Worker pool initialization failed"
                    );
                    self.close_workers(&created).await;
                    return Err(PoolError::Worker(e));
                }
            }
        }

        state.slots = created
            .into_iter()
            .map(|handle| WorkerSlot {
                handle: Some(handle),
                claimed_by: None,
            })
            .collect();
        state.initialized = true;

        info!(pool_size = pool_size, "Resource pool initialized");
        Ok(())
    }

    /// Claims `count` healthy workers for `store_id`, waiting up to
    /// `max_wait`.
    ///
    /// Availability is re-scanned every poll interval. Disconnected idle
    /// workers met during a scan are replaced in place. Claims made during a
    /// failed attempt are always handed back.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before [`ResourcePool::initialize`]
    /// - `ExceedsPoolSize` when `count` can never be satisfied
    /// - `AlreadyAllocated` when the store already holds resources
    /// - `ResourceTimeout` when `max_wait` elapses
    /// - `Worker` when a session cannot be opened
    pub async fn acquire_workers(
        &self,
        store_id: &str,
        count: usize,
        max_wait: Duration,
    ) -> Result<Vec<WorkerGrant>, PoolError> {
        {
            let mut state = self.state.lock().await;
            if !state.initialized {
                return Err(PoolError::NotInitialized);
            }
            if count > state.slots.len() {
                return Err(PoolError::ExceedsPoolSize {
                    requested: count,
                    pool_size: state.slots.len(),
                });
            }
            if state.allocations.contains_key(store_id) || !state.pending.insert(store_id.to_string())
            {
                return Err(PoolError::AlreadyAllocated(store_id.to_string()));
            }
        }

        let result = self.claim_workers(store_id, count, max_wait).await;

        let mut state = self.state.lock().await;
        state.pending.remove(store_id);
        let grants = result?;

        state.allocations.insert(
            store_id.to_string(),
            ResourceAllocation {
                store_id: store_id.to_string(),
                grants: grants.clone(),
                api_quota: 0,
                allocated_at: Utc::now(),
                held_since: Instant::now(),
            },
        );
        self.metrics.set_workers_allocated(state.allocated());

        debug!(store_id = %store_id, workers = grants.len(), "Workers acquired");
        Ok(grants)
    }

    /// Computes the API quota available to `store_id` right now. Never waits;
    /// the grant may be smaller than requested, including zero.
    pub async fn acquire_api_quota(&self, store_id: &str, requested: u64) -> QuotaGrant {
        let grant = self.limiter().grant(requested);
        if grant.is_partial() {
            debug!(
                store_id = %store_id,
                requested = grant.requested,
                granted = grant.granted,
                from_burst = grant.from_burst,
                "API quota partially granted"
            );
        }

        let mut state = self.state.lock().await;
        if let Some(allocation) = state.allocations.get_mut(store_id) {
            allocation.api_quota = grant.granted;
        }
        grant
    }

    /// Charges `count` API requests against the current window.
    pub fn record_api_request(&self, count: u64) {
        if count == 0 {
            return;
        }

        let notice = self.limiter().record(count);
        self.metrics.record_api_requests(count);

        if let Some(notice) = notice {
            self.counters.throttle_events.fetch_add(1, Ordering::SeqCst);
            self.metrics.record_api_throttle();
            warn!(
                requests_this_window = notice.requests_this_window,
                burst_used = notice.burst_used,
                burst_limit = notice.burst_limit,
                "API burst limit exceeded"
            );
            self.events.emit(SchedulerEvent::ApiThrottled {
                requests_this_window: notice.requests_this_window,
                burst_used: notice.burst_used,
                burst_limit: notice.burst_limit,
            });
        }
    }

    /// Releases everything `store_id` holds. Calling it without an
    /// allocation is a logged no-op.
    ///
    /// Sessions are closed first, then healthy workers return to the pool and
    /// disconnected ones are replaced. Close failures are logged and never
    /// stop the remaining steps.
    pub async fn release_resources(&self, store_id: &str) {
        let allocation = self.state.lock().await.allocations.remove(store_id);
        let Some(allocation) = allocation else {
            debug!(store_id = %store_id, "No allocation to release");
            return;
        };

        self.close_sessions(store_id, &allocation.grants).await;

        let mut state = self.state.lock().await;
        for grant in &allocation.grants {
            let connected = match state.slots.get(grant.slot) {
                Some(slot) => slot
                    .handle
                    .as_ref()
                    .is_some_and(|h| self.factory.is_connected(h)),
                // arena was torn down by shutdown
                None => continue,
            };

            if !connected {
                self.replace_worker(&mut state, grant.slot, Some(store_id))
                    .await;
            }
            state.slots[grant.slot].claimed_by = None;
        }
        self.metrics.set_workers_allocated(state.allocated());

        info!(
            store_id = %store_id,
            workers = allocation.grants.len(),
            held_ms = allocation.held_since.elapsed().as_millis() as u64,
            "Resources released"
        );
    }

    /// Returns a point-in-time snapshot of pool and API usage.
    pub async fn usage_stats(&self) -> ResourceUsageStats {
        let api = self.limiter().snapshot();
        let state = self.state.lock().await;

        let total = state.slots.len();
        let allocated = state.allocated();
        let vacant = state
            .slots
            .iter()
            .filter(|s| s.claimed_by.is_none() && s.handle.is_none())
            .count();
        let utilization_percent = if total == 0 {
            0.0
        } else {
            allocated as f64 / total as f64 * 100.0
        };

        let mut allocations: Vec<AllocationUsage> = state
            .allocations
            .values()
            .map(|a| AllocationUsage {
                store_id: a.store_id.clone(),
                workers: a.grants.len(),
                api_quota: a.api_quota,
                allocated_at: a.allocated_at,
                duration_ms: a.held_since.elapsed().as_millis() as u64,
            })
            .collect();
        allocations.sort_by(|a, b| a.store_id.cmp(&b.store_id));

        ResourceUsageStats {
            pool: PoolUsage {
                total,
                allocated,
                available: total - allocated - vacant,
                vacant,
                utilization_percent,
            },
            api,
            allocations,
            worker_crashes: self.counters.worker_crashes.load(Ordering::SeqCst),
            throttle_events: self.counters.throttle_events.load(Ordering::SeqCst),
        }
    }

    /// Probes every worker once. Emits `HealthCheck` when any is unhealthy;
    /// does not evict anything itself.
    pub async fn health_check(&self) -> HealthReport {
        let state = self.state.lock().await;
        let total = state.slots.len();
        let healthy = state
            .slots
            .iter()
            .filter(|s| s.handle.as_ref().is_some_and(|h| self.factory.is_connected(h)))
            .count();
        drop(state);

        let report = HealthReport {
            total,
            healthy,
            unhealthy: total - healthy,
        };

        if report.unhealthy > 0 {
            warn!(
                total = report.total,
                healthy = report.healthy,
                unhealthy = report.unhealthy,
                "Worker health check found unhealthy workers"
            );
            self.events.emit(SchedulerEvent::HealthCheck {
                total: report.total,
                healthy: report.healthy,
                unhealthy: report.unhealthy,
            });
        } else {
            debug!(total = total, "Worker health check passed");
        }

        report
    }

    /// Starts the background health check at the configured interval.
    /// The task stops on its own once the pool is dropped.
    pub fn spawn_health_check(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let period = self.config.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.health_check().await;
            }
        });

        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the health check and closes every worker.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let workers: Vec<WorkerHandle> = {
            let mut state = self.state.lock().await;
            if !state.initialized {
                return;
            }
            if !state.allocations.is_empty() {
                warn!(
                    allocations = state.allocations.len(),
                    "Shutting down pool with live allocations"
                );
            }
            state.allocations.clear();
            state.initialized = false;
            state.slots.drain(..).filter_map(|s| s.handle).collect()
        };

        self.close_workers(&workers).await;
        self.metrics.set_workers_allocated(0);
        info!(workers = workers.len(), "Resource pool shut down");
    }

    /// Number of slots in the arena.
    pub async fn size(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    async fn claim_workers(
        &self,
        store_id: &str,
        count: usize,
        max_wait: Duration,
    ) -> Result<Vec<WorkerGrant>, PoolError> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut claimed: Vec<(usize, WorkerHandle)> = Vec::with_capacity(count);

        loop {
            {
                let mut state = self.state.lock().await;
                self.scan_and_claim(&mut state, store_id, count, &mut claimed)
                    .await;
            }
            if claimed.len() >= count {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                let slots: Vec<usize> = claimed.iter().map(|(slot, _)| *slot).collect();
                self.unclaim(&slots).await;
                warn!(
                    store_id = %store_id,
                    requested = count,
                    claimed = slots.len(),
                    "Timed out waiting for workers"
                );
                return Err(PoolError::ResourceTimeout {
                    store_id: store_id.to_string(),
                    requested: count,
                    waited: now - started,
                });
            }

            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }

        let slots: Vec<usize> = claimed.iter().map(|(slot, _)| *slot).collect();
        let mut grants = Vec::with_capacity(count);
        for (slot, worker) in claimed {
            match self.factory.open_session(&worker).await {
                Ok(session) => grants.push(WorkerGrant {
                    slot,
                    worker,
                    session,
                }),
                Err(e) => {
                    warn!(store_id = %store_id, slot = slot, error = %e, "Failed to open session");
                    self.close_sessions(store_id, &grants).await;
                    self.unclaim(&slots).await;
                    return Err(PoolError::Worker(e));
                }
            }
        }

        Ok(grants)
    }

    async fn scan_and_claim(
        &self,
        state: &mut PoolState,
        store_id: &str,
        count: usize,
        claimed: &mut Vec<(usize, WorkerHandle)>,
    ) {
        for slot in 0..state.slots.len() {
            if claimed.len() >= count {
                break;
            }
            if state.slots[slot].claimed_by.is_some() {
                continue;
            }

            let healthy = state.slots[slot]
                .handle
                .as_ref()
                .is_some_and(|h| self.factory.is_connected(h));
            if !healthy {
                self.replace_worker(state, slot, None).await;
            }

            if let Some(handle) = state.slots[slot].handle.clone() {
                state.slots[slot].claimed_by = Some(store_id.to_string());
                claimed.push((slot, handle));
            }
        }
    }

    /// Evicts the worker in `slot` (if any) and installs a new one. A failed
    /// creation leaves the slot vacant; the next scan retries it.
    async fn replace_worker(&self, state: &mut PoolState, slot: usize, store_id: Option<&str>) {
        if let Some(old) = state.slots[slot].handle.take() {
            self.counters.worker_crashes.fetch_add(1, Ordering::SeqCst);
            self.metrics.record_worker_crash();
            warn!(
                slot = slot,
                worker_id = %old.id,
                store_id = store_id.unwrap_or("-"),
                "Worker disconnected, replacing"
            );
            self.events.emit(SchedulerEvent::WorkerCrashed {
                slot,
                worker_id: old.id.to_string(),
                store_id: store_id.map(str::to_string),
            });

            if let Err(e) = self.factory.close(&old).await {
                debug!(worker_id = %old.id, error = %e, "Closing crashed worker failed");
            }
        }

        match self.factory.create().await {
            Ok(handle) => {
                debug!(slot = slot, worker_id = %handle.id, "Worker slot filled");
                state.slots[slot].handle = Some(handle);
            }
            Err(e) => {
                error!(slot = slot, error = %e, "Failed to create replacement worker");
            }
        }
    }

    async fn unclaim(&self, slots: &[usize]) {
        let mut state = self.state.lock().await;
        for &slot in slots {
            if let Some(slot) = state.slots.get_mut(slot) {
                slot.claimed_by = None;
            }
        }
    }

    async fn close_sessions(&self, store_id: &str, grants: &[WorkerGrant]) {
        let results = join_all(
            grants
                .iter()
                .map(|grant| self.factory.close_session(&grant.session)),
        )
        .await;

        for (grant, result) in grants.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    store_id = %store_id,
                    slot = grant.slot,
                    session_id = %grant.session.id,
                    error = %e,
                    "Failed to close session"
                );
            }
        }
    }

    async fn close_workers(&self, workers: &[WorkerHandle]) {
        let results = join_all(workers.iter().map(|w| self.factory.close(w))).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(worker_id = %worker.id, error = %e, "Failed to close worker");
            }
        }
    }

    fn limiter(&self) -> std::sync::MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if let Some(task) = self
            .health_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
