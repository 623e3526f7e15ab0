//! Resource pool manager.
//!
//! This module provides:
//! - A fixed-size, self-healing pool of crash-prone workers
//! - A tumbling-window limiter for the external API budget
//! - The [`WorkerFactory`] seam used to create and probe workers

pub mod pool;
pub mod rate_limiter;
pub mod worker;

pub use pool::{
    AllocationUsage, HealthReport, PoolUsage, ResourceAllocation, ResourcePool, ResourceUsageStats,
};
pub use rate_limiter::{QuotaGrant, RateLimitSnapshot, RateLimiter, ThrottleNotice, RATE_WINDOW};
pub use worker::{SessionHandle, WorkerFactory, WorkerGrant, WorkerHandle};
