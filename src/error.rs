//! Error types for fleet-scheduler operations.
//!
//! Defines error types for each subsystem:
//! - Worker pool and API quota management
//! - Store queue administration
//! - Store registry and catalog persistence
//! - Task pipeline execution
//! - Per-store processing and the orchestrator loop

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a worker resource primitive.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("Failed to open session on worker {worker_id}: {message}")]
    SessionFailed { worker_id: String, message: String },

    #[error("Failed to close {target}: {message}")]
    CloseFailed { target: String, message: String },
}

/// Errors that can occur in the resource pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Resource pool is not initialized")]
    NotInitialized,

    #[error("Resource pool is already initialized with {0} workers")]
    AlreadyInitialized(usize),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Timed out after {waited:?} waiting for {requested} workers for store '{store_id}'")]
    ResourceTimeout {
        store_id: String,
        requested: usize,
        waited: Duration,
    },

    #[error("Requested {requested} workers but the pool only holds {pool_size}")]
    ExceedsPoolSize { requested: usize, pool_size: usize },

    #[error("Store '{0}' already holds a resource allocation")]
    AlreadyAllocated(String),
}

/// Errors that can occur in the store queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store '{0}' is not queued")]
    NotQueued(String),
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Store '{0}' not found in registry")]
    NotFound(String),

    #[error("Store '{0}' already exists in registry")]
    DuplicateStore(String),

    #[error("Store '{0}' is quarantined; release it before enabling")]
    Quarantined(String),

    #[error("Invalid processing window for store '{store_id}': {reason}")]
    InvalidWindow { store_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a task pipeline implementation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline execution failed: {0}")]
    Execution(String),

    #[error("Pipeline timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that end a single store's processing attempt.
///
/// These never escape the per-store boundary; the orchestrator converts
/// them into a failed processing result.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Resource error: {0}")]
    Resource(#[from] PoolError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Processing unit aborted: {0}")]
    Aborted(String),
}

/// Errors that can occur in the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Resource pool error: {0}")]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_timeout_display() {
        let err = PoolError::ResourceTimeout {
            store_id: "store-1".to_string(),
            requested: 2,
            waited: Duration::from_secs(60),
        };
        let msg = err.to_string();
        assert!(msg.contains("store-1"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_processing_error_from_pool() {
        let err: ProcessingError = PoolError::NotInitialized.into();
        assert!(matches!(err, ProcessingError::Resource(_)));
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_registry_not_found_display() {
        let err = RegistryError::NotFound("missing".to_string());
        assert_eq!(err.to_string(), "Store 'missing' not found in registry");
    }
}
