//! Worker resource primitive.
//!
//! A worker is a crash-prone execution context (for example a browser
//! process). The pool only needs to create one, ask whether it is still
//! connected, and close it. Each allocation additionally opens an ephemeral
//! session on every granted worker, closed again on release.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::WorkerError;

/// Opaque handle to a pooled worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerHandle {
    pub id: Uuid,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-allocation handle opened on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub worker_id: Uuid,
}

impl SessionHandle {
    pub fn new(worker: &WorkerHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker.id,
        }
    }
}

/// A worker granted to a store for one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerGrant {
    /// Arena slot the worker occupies.
    pub slot: usize,
    pub worker: WorkerHandle,
    pub session: SessionHandle,
}

/// Creates, probes and destroys workers.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Launch a new worker.
    async fn create(&self) -> Result<WorkerHandle, WorkerError>;

    /// Cheap liveness probe; must not block.
    fn is_connected(&self, worker: &WorkerHandle) -> bool;

    /// Tear the worker down.
    async fn close(&self, worker: &WorkerHandle) -> Result<(), WorkerError>;

    /// Open an ephemeral session for one allocation.
    async fn open_session(&self, worker: &WorkerHandle) -> Result<SessionHandle, WorkerError> {
        Ok(SessionHandle::new(worker))
    }

    async fn close_session(&self, _session: &SessionHandle) -> Result<(), WorkerError> {
        Ok(())
    }
}
