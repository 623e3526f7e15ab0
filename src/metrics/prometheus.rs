//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fleet_scheduler and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fleet_scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Store processing attempts, labeled by status and priority.
pub static STORES_PROCESSED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Store processing duration in seconds, labeled by priority.
pub static STORE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of queued stores, labeled by tier.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently allocated to stores.
pub static WORKERS_ALLOCATED: OnceLock<Gauge> = OnceLock::new();

/// Total workers found disconnected and replaced.
pub static WORKER_CRASHES: OnceLock<Counter> = OnceLock::new();

/// Total API requests recorded against the rate limiter.
pub static API_REQUESTS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Total windows in which the API burst limit was exceeded.
pub static API_THROTTLES: OnceLock<Counter> = OnceLock::new();

/// Number of stores currently quarantined.
pub static QUARANTINED_STORES: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Store metrics
    let stores_processed_total = CounterVec::new(
        Opts::new(
            "fleet_stores_processed_total",
            "Total store processing attempts",
        ),
        &["status", "priority"],
    )?;

    let store_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "fleet_store_duration_seconds",
            "Store processing duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["priority"],
    )?;

    let quarantined_stores = Gauge::new(
        "fleet_quarantined_stores",
        "Number of stores currently quarantined",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("fleet_queue_depth", "Number of queued stores"),
        &["tier"],
    )?;

    // Resource metrics
    let workers_allocated = Gauge::new(
        "fleet_workers_allocated",
        "Number of workers currently allocated to stores",
    )?;

    let worker_crashes = Counter::new(
        "fleet_worker_crashes_total",
        "Total workers found disconnected and replaced",
    )?;

    let api_requests_total = Counter::new(
        "fleet_api_requests_total",
        "Total API requests recorded against the rate limiter",
    )?;

    let api_throttles = Counter::new(
        "fleet_api_throttles_total",
        "Total rate windows in which the API burst limit was exceeded",
    )?;

    registry.register(Box::new(stores_processed_total.clone()))?;
    registry.register(Box::new(store_duration.clone()))?;
    registry.register(Box::new(quarantined_stores.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(workers_allocated.clone()))?;
    registry.register(Box::new(worker_crashes.clone()))?;
    registry.register(Box::new(api_requests_total.clone()))?;
    registry.register(Box::new(api_throttles.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STORES_PROCESSED_TOTAL.set(stores_processed_total);
    let _ = STORE_DURATION.set(store_duration);
    let _ = QUARANTINED_STORES.set(quarantined_stores);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = WORKERS_ALLOCATED.set(workers_allocated);
    let _ = WORKER_CRASHES.set(worker_crashes);
    let _ = API_REQUESTS_TOTAL.set(api_requests_total);
    let _ = API_THROTTLES.set(api_throttles);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
