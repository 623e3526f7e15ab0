//! Queue entries and priority scoring.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::registry::Store;

/// Score penalty per recorded failure.
pub const FAILURE_PENALTY: i64 = 10;

/// Score bonus per idle day.
pub const IDLE_BONUS_PER_DAY: i64 = 5;

/// Upper bound on the idle bonus.
pub const MAX_IDLE_BONUS: i64 = 100;

/// Computes the dequeue score of `store` at `now`.
///
/// `base(priority) - 10 * failures + min(100, 5 * idle_days)`, floored at 0.
/// Idle days count from the last successful run, or from registration for
/// stores that never ran.
pub fn priority_score(store: &Store, now: DateTime<Utc>) -> i64 {
    let idle_since = store
        .metadata
        .last_processed_at
        .unwrap_or(store.metadata.created_at);
    let idle_days = (now - idle_since).num_days().max(0);
    let idle_bonus = (IDLE_BONUS_PER_DAY * idle_days).min(MAX_IDLE_BONUS);
    let penalty = FAILURE_PENALTY * i64::from(store.metadata.failure_count);

    (store.priority.base_score() - penalty + idle_bonus).max(0)
}

/// A store waiting in the queue for one scheduling attempt.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    /// Registry snapshot taken at enqueue time.
    pub store: Store,
    pub priority_score: i64,
    /// Attempts made before this one.
    pub attempts: u32,
    pub queued_at: Instant,
    /// Wall-clock enqueue time, for reporting.
    pub enqueued_at: DateTime<Utc>,
    /// Not eligible for dequeue before this instant.
    pub next_retry_at: Option<Instant>,
}

impl QueuedEntry {
    pub fn store_id(&self) -> &str {
        &self.store.id
    }

    /// Whether the entry may be dequeued at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Earliest instant the entry becomes ready.
    pub fn ready_at(&self) -> Instant {
        self.next_retry_at.unwrap_or(self.queued_at)
    }
}
