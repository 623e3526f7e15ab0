//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for scheduler
//! operations: store outcomes and durations, queue depth, worker allocation
//! and crashes, API usage and throttling, and quarantine counts.
//!
//! # Example
//!
//! ```ignore
//! use fleet_scheduler::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.set_queue_depth("high", 3);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    API_REQUESTS_TOTAL, API_THROTTLES, QUARANTINED_STORES, QUEUE_DEPTH, REGISTRY,
    STORES_PROCESSED_TOTAL, STORE_DURATION, WORKERS_ALLOCATED, WORKER_CRASHES,
};
