//! fleet_scheduler: priority scheduler for multi-tenant store processing.
//!
//! This library decides which stores run, when, and with which shared
//! resources. It provides a store registry with quarantine, a tiered
//! priority queue with backoff retries, a worker pool and API rate limiter,
//! and an orchestrator that runs an injected task pipeline per store under
//! bounded concurrency.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod scheduler;

pub use config::{ConfigError, SchedulerConfig};
pub use events::{EventBus, SchedulerEvent};
pub use orchestrator::{AggregatedReport, Orchestrator, OrchestratorStatus};
pub use pipeline::{PipelineRequest, ProcessingResult, StepResult, StepResults, TaskPipeline};
pub use registry::{Priority, Store, StoreRegistry};
pub use resources::{ResourcePool, WorkerFactory, WorkerGrant};
pub use scheduler::StoreQueue;

// Re-export commonly used error types
pub use error::{
    OrchestratorError, PipelineError, PoolError, ProcessingError, QueueError, RegistryError,
    WorkerError,
};
