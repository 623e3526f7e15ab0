//! Scheduler events.
//!
//! Components publish [`SchedulerEvent`]s on an [`EventBus`], a thin wrapper
//! over a tokio broadcast channel. Observers call [`EventBus::subscribe`] and
//! receive every event published after subscribing. Publishing never blocks
//! and never fails; with no subscribers events are dropped.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications emitted by the pool, queue and orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StoreProcessingStarted {
        store_id: String,
        attempt: u32,
    },
    StoreProcessingCompleted {
        store_id: String,
        duration_ms: u64,
    },
    StoreProcessingFailed {
        store_id: String,
        error: String,
        failure_count: u32,
    },
    StoreQuarantined {
        store_id: String,
        reason: String,
        failure_count: u32,
    },
    /// Usage in the current window went past the burst allowance.
    ApiThrottled {
        requests_this_window: u64,
        burst_used: u64,
        burst_limit: u64,
    },
    /// A pooled worker was found disconnected and replaced.
    WorkerCrashed {
        slot: usize,
        worker_id: String,
        store_id: Option<String>,
    },
    HealthCheck {
        total: usize,
        healthy: usize,
        unhealthy: usize,
    },
    QueueMaxRetriesExceeded {
        store_id: String,
        attempts: u32,
    },
}

impl SchedulerEvent {
    /// Short machine-readable name, used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::StoreProcessingStarted { .. } => "store_processing_started",
            SchedulerEvent::StoreProcessingCompleted { .. } => "store_processing_completed",
            SchedulerEvent::StoreProcessingFailed { .. } => "store_processing_failed",
            SchedulerEvent::StoreQuarantined { .. } => "store_quarantined",
            SchedulerEvent::ApiThrottled { .. } => "api_throttled",
            SchedulerEvent::WorkerCrashed { .. } => "worker_crashed",
            SchedulerEvent::HealthCheck { .. } => "health_check",
            SchedulerEvent::QueueMaxRetriesExceeded { .. } => "queue_max_retries_exceeded",
        }
    }
}

/// Publisher side of the scheduler event channel. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event to all current observers.
    pub fn emit(&self, event: SchedulerEvent) {
        tracing::trace!(event = event.name(), "Emitting scheduler event");
        // Err only means there are no subscribers.
        let _ = self.tx.send(event);
    }

    /// Number of active observers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drains every event currently buffered in `rx` without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped = skipped, "Event observer lagged");
            }
            Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    events
}
