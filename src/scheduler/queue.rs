//! Three-tier priority queue of stores awaiting processing.
//!
//! Each tier is kept sorted by descending score. Dequeue scans tiers from
//! high to low and takes the first entry that is ready, so a store waiting
//! out its retry delay never blocks the entries behind it.
//!
//! All tier mutations happen under a single mutex guard; a store id can
//! therefore never be present twice or be handed to two callers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::MetricsCollector;
use crate::registry::{Priority, Store};

use super::entry::{priority_score, QueuedEntry};

/// Default number of wait-time samples kept for statistics.
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

const HOUR: Duration = Duration::from_secs(3600);

/// What [`StoreQueue::requeue`] did with a failed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Re-enqueued; not ready before `retry_at`.
    Scheduled {
        attempts: u32,
        delay: Duration,
        retry_at: Instant,
    },
    /// The retry ladder is exhausted; the store was not re-enqueued.
    Exhausted { attempts: u32 },
    /// The store id was already queued.
    Duplicate,
}

/// Queue lengths per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierLengths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Snapshot returned by [`StoreQueue::statistics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub tiers: TierLengths,
    pub total: usize,
    pub ready: usize,
    /// Rolling average time from enqueue to start.
    pub average_wait_ms: Option<u64>,
    /// Stores started in the last hour.
    pub hourly_rate: f64,
    /// Time to drain the queue at the current rate; `None` when the rate is 0.
    pub eta_ms: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    tiers: [Vec<QueuedEntry>; 3],
    wait_samples: VecDeque<Duration>,
    starts: VecDeque<Instant>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    fn contains(&self, store_id: &str) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.iter().any(|e| e.store.id == store_id))
    }
}

/// Priority queue with retry backoff.
pub struct StoreQueue {
    state: Mutex<QueueState>,
    /// Delay before retry `n` is `ladder[n - 1]`.
    ladder: Vec<Duration>,
    sample_size: usize,
    events: EventBus,
    metrics: MetricsCollector,
}

impl StoreQueue {
    /// Creates an empty queue using `ladder` as the retry schedule.
    pub fn new(ladder: Vec<Duration>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ladder,
            sample_size: DEFAULT_SAMPLE_SIZE,
            events,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets how many wait-time samples feed the rolling average.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    /// Retry schedule in use.
    pub fn ladder(&self) -> &[Duration] {
        &self.ladder
    }

    /// Adds `store` to its tier. Returns `false` (and logs a warning) when the
    /// store id is already queued.
    ///
    /// With `attempts > 0` the entry is held back by the retry ladder.
    pub fn enqueue(&self, store: Store, attempts: u32) -> bool {
        self.enqueue_at(store, attempts, Instant::now(), Utc::now())
    }

    /// Removes and returns the best ready entry, or `None` when nothing is
    /// ready in any tier.
    pub fn dequeue(&self) -> Option<QueuedEntry> {
        self.dequeue_at(Instant::now())
    }

    /// Re-enqueues a store whose attempt failed after `previous_attempts`
    /// earlier attempts, or reports the retry ladder exhausted.
    pub fn requeue(&self, store: Store, previous_attempts: u32) -> RequeueOutcome {
        self.requeue_at(store, previous_attempts, Instant::now(), Utc::now())
    }

    /// Removes a queued store without processing it.
    pub fn remove(&self, store_id: &str) -> Result<QueuedEntry, QueueError> {
        let mut state = self.lock();
        for tier in Priority::ALL {
            let entries = &mut state.tiers[tier.index()];
            if let Some(pos) = entries.iter().position(|e| e.store.id == store_id) {
                let entry = entries.remove(pos);
                self.publish_depth(&state, tier);
                debug!(store_id = %store_id, "Removed store from queue");
                return Ok(entry);
            }
        }
        Err(QueueError::NotQueued(store_id.to_string()))
    }

    /// Removes and returns every queued entry, highest tier first.
    pub fn drain(&self) -> Vec<QueuedEntry> {
        let mut state = self.lock();
        let mut drained = Vec::with_capacity(state.len());
        for tier in Priority::ALL {
            drained.append(&mut state.tiers[tier.index()]);
            self.publish_depth(&state, tier);
        }
        drained
    }

    /// Drops every queued entry and returns how many were removed.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    pub fn contains(&self, store_id: &str) -> bool {
        self.lock().contains(store_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that could be dequeued right now.
    pub fn peek_ready_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .tiers
            .iter()
            .flatten()
            .filter(|e| e.is_ready(now))
            .count()
    }

    /// Earliest instant any queued entry becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.lock()
            .tiers
            .iter()
            .flatten()
            .map(QueuedEntry::ready_at)
            .min()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.statistics_at(Instant::now())
    }

    pub(crate) fn enqueue_at(
        &self,
        store: Store,
        attempts: u32,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.lock();
        if state.contains(&store.id) {
            warn!(store_id = %store.id, "Store already queued, ignoring enqueue");
            return false;
        }

        let next_retry_at = if attempts > 0 {
            Some(now + self.retry_delay(attempts - 1))
        } else {
            None
        };

        let tier = store.priority;
        let entry = QueuedEntry {
            priority_score: priority_score(&store, wall_now),
            store,
            attempts,
            queued_at: now,
            enqueued_at: wall_now,
            next_retry_at,
        };

        debug!(
            store_id = %entry.store.id,
            priority = %tier,
            score = entry.priority_score,
            attempts = attempts,
            "Store enqueued"
        );

        let entries = &mut state.tiers[tier.index()];
        entries.push(entry);
        // stable: equal scores keep arrival order
        entries.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
        self.publish_depth(&state, tier);

        true
    }

    pub(crate) fn dequeue_at(&self, now: Instant) -> Option<QueuedEntry> {
        let mut state = self.lock();

        for tier in Priority::ALL {
            let entries = &mut state.tiers[tier.index()];
            let Some(pos) = entries.iter().position(|e| e.is_ready(now)) else {
                continue;
            };
            let entry = entries.remove(pos);

            let waited = now.saturating_duration_since(entry.queued_at);
            state.wait_samples.push_back(waited);
            while state.wait_samples.len() > self.sample_size {
                state.wait_samples.pop_front();
            }
            state.starts.push_back(now);
            prune_starts(&mut state.starts, now);
            self.publish_depth(&state, tier);

            debug!(
                store_id = %entry.store.id,
                priority = %tier,
                waited_ms = waited.as_millis() as u64,
                "Store dequeued"
            );
            return Some(entry);
        }

        None
    }

    pub(crate) fn requeue_at(
        &self,
        store: Store,
        previous_attempts: u32,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> RequeueOutcome {
        if previous_attempts as usize >= self.ladder.len() {
            warn!(
                store_id = %store.id,
                attempts = previous_attempts,
                "Max retries exceeded, not requeueing"
            );
            self.events.emit(SchedulerEvent::QueueMaxRetriesExceeded {
                store_id: store.id,
                attempts: previous_attempts,
            });
            return RequeueOutcome::Exhausted {
                attempts: previous_attempts,
            };
        }

        let store_id = store.id.clone();
        let attempts = previous_attempts + 1;
        let delay = self.retry_delay(previous_attempts);
        if !self.enqueue_at(store, attempts, now, wall_now) {
            return RequeueOutcome::Duplicate;
        }

        info!(
            store_id = %store_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Store requeued for retry"
        );
        RequeueOutcome::Scheduled {
            attempts,
            delay,
            retry_at: now + delay,
        }
    }

    pub(crate) fn statistics_at(&self, now: Instant) -> QueueStatistics {
        let mut state = self.lock();
        prune_starts(&mut state.starts, now);

        let tiers = TierLengths {
            high: state.tiers[Priority::High.index()].len(),
            medium: state.tiers[Priority::Medium.index()].len(),
            low: state.tiers[Priority::Low.index()].len(),
        };
        let total = state.len();
        let ready = state
            .tiers
            .iter()
            .flatten()
            .filter(|e| e.is_ready(now))
            .count();

        let average_wait_ms = if state.wait_samples.is_empty() {
            None
        } else {
            let sum: Duration = state.wait_samples.iter().sum();
            Some((sum / state.wait_samples.len() as u32).as_millis() as u64)
        };

        let hourly_rate = state.starts.len() as f64;
        let eta_ms = if hourly_rate > 0.0 {
            Some((total as f64 / hourly_rate * HOUR.as_millis() as f64).round() as u64)
        } else {
            None
        };

        QueueStatistics {
            tiers,
            total,
            ready,
            average_wait_ms,
            hourly_rate,
            eta_ms,
        }
    }

    fn retry_delay(&self, previous_attempts: u32) -> Duration {
        match self.ladder.len() {
            0 => Duration::ZERO,
            len => self.ladder[(previous_attempts as usize).min(len - 1)],
        }
    }

    fn publish_depth(&self, state: &QueueState, tier: Priority) {
        self.metrics
            .set_queue_depth(&tier.to_string(), state.tiers[tier.index()].len());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prune_starts(starts: &mut VecDeque<Instant>, now: Instant) {
    while starts
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
    {
        starts.pop_front();
    }
}
