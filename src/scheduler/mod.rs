//! Priority queue manager.
//!
//! Stores awaiting processing wait in three tiers (high, medium, low). Within
//! a tier entries are ordered by a numeric score that rewards idle stores and
//! penalizes chronically failing ones:
//!
//! ```text
//! score = base(priority) - 10 * failure_count + min(100, 5 * idle_days)
//!
//!   high   1000 ─┐
//!   medium  500 ─┼─► dequeue scans high → medium → low,
//!   low     100 ─┘   first entry whose retry delay has passed
//! ```
//!
//! Failed stores are requeued along a backoff ladder (default 1m, 5m, 15m).
//! Once the ladder is exhausted the store is dropped from the run and a
//! `QueueMaxRetriesExceeded` event is emitted.

pub mod entry;
pub mod queue;

pub use entry::{priority_score, QueuedEntry};
pub use queue::{QueueStatistics, RequeueOutcome, StoreQueue, TierLengths};
