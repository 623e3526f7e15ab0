//! Recording interface for scheduler metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent labels.
//! Every method is a no-op until `init_metrics()` has run, so components can
//! record unconditionally, including in tests.

use super::prometheus::{
    API_REQUESTS_TOTAL, API_THROTTLES, QUARANTINED_STORES, QUEUE_DEPTH, STORES_PROCESSED_TOTAL,
    STORE_DURATION, WORKERS_ALLOCATED, WORKER_CRASHES,
};

/// Metrics collector for recording scheduler operational metrics.
///
/// # Example
///
/// ```ignore
/// use fleet_scheduler::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_store_processed("completed", "high", 42.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one finished processing attempt.
    ///
    /// # Arguments
    ///
    /// * `status` - Final status ("completed" or "failed")
    /// * `priority` - Store priority tier
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_store_processed(&self, status: &str, priority: &str, duration_secs: f64) {
        if let Some(total) = STORES_PROCESSED_TOTAL.get() {
            total.with_label_values(&[status, priority]).inc();
        }

        if let Some(duration) = STORE_DURATION.get() {
            duration
                .with_label_values(&[priority])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            priority = priority,
            duration_secs = duration_secs,
            "Recorded store metric"
        );
    }

    /// Set the depth of one queue tier.
    pub fn set_queue_depth(&self, tier: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[tier]).set(depth as f64);
        }
    }

    /// Set the number of workers currently allocated.
    pub fn set_workers_allocated(&self, count: usize) {
        if let Some(gauge) = WORKERS_ALLOCATED.get() {
            gauge.set(count as f64);
        }
    }

    pub fn record_worker_crash(&self) {
        if let Some(counter) = WORKER_CRASHES.get() {
            counter.inc();
        }
    }

    pub fn record_api_requests(&self, count: u64) {
        if let Some(counter) = API_REQUESTS_TOTAL.get() {
            counter.inc_by(count as f64);
        }
    }

    pub fn record_api_throttle(&self) {
        if let Some(counter) = API_THROTTLES.get() {
            counter.inc();
        }
    }

    /// Set the number of quarantined stores.
    pub fn set_quarantined_stores(&self, count: usize) {
        if let Some(gauge) = QUARANTINED_STORES.get() {
            gauge.set(count as f64);
        }
    }
}
