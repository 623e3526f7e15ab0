//! Task pipeline contract.
//!
//! The per-store business work (extraction, external checks, report
//! generation) lives outside the scheduler. The scheduler hands an injected
//! [`TaskPipeline`] the store's opaque configuration and the workers it was
//! granted, and reads back a map of named step results. Only aggregate
//! success and numeric metric fields of that map are interpreted.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use fleet_scheduler::pipeline::{PipelineRequest, StepResult, StepResults, TaskPipeline};
//! use fleet_scheduler::error::PipelineError;
//!
//! struct ExtractOnly;
//!
//! #[async_trait]
//! impl TaskPipeline for ExtractOnly {
//!     async fn execute(&self, request: PipelineRequest<'_>) -> Result<StepResults, PipelineError> {
//!         let mut steps = StepResults::new();
//!         steps.insert(
//!             "extract".to_string(),
//!             StepResult::ok(serde_json::json!({ "records": 42, "api_calls": 3 }), 1200),
//!         );
//!         Ok(steps)
//!     }
//! }
//! ```

pub mod result;

pub use result::{ProcessingResult, ProcessingStatus, StepResult, StepResults, API_CALLS_METRIC};

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::resources::WorkerGrant;

/// Everything a pipeline run is given for one store.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub store_id: &'a str,
    /// Opaque per-store configuration.
    pub config: &'a serde_json::Value,
    pub workers: &'a [WorkerGrant],
    /// API requests the run may make; possibly zero.
    pub api_quota: u64,
    /// Attempts made before this one.
    pub attempt: u32,
}

/// Executes the multi-step work of one store.
///
/// Returning `Err` and returning step results with failures are treated
/// alike by the scheduler. Any hard timeout is the implementation's
/// responsibility.
#[async_trait]
pub trait TaskPipeline: Send + Sync {
    async fn execute(&self, request: PipelineRequest<'_>) -> Result<StepResults, PipelineError>;
}
