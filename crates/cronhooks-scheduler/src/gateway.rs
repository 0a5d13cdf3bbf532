//! Dispatch Gateway: the seam between the engine and whatever task queue
//! actually delivers `(job, attempt)` pairs to the executor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronhooks_core::JobId;

use crate::error::DispatchError;
use crate::registry::PeriodicTrigger;
use crate::types::{DispatchHandle, TriggerId};

/// A unit of work handed to the executor by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub attempt_number: u32,
}

/// Enqueue, revoke and periodic-binding operations on the task queue.
///
/// Handles returned by the enqueue calls are opaque; revoking a handle that
/// already fired yields [`DispatchError::UnknownHandle`].
#[async_trait]
pub trait DispatchGateway: Send + Sync {
    /// Deliver attempt 1 of `job_id` at `at`.
    async fn enqueue_at(
        &self,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DispatchHandle, DispatchError>;

    async fn enqueue_now(
        &self,
        job_id: &JobId,
        attempt_number: u32,
    ) -> Result<DispatchHandle, DispatchError>;

    async fn enqueue_after(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        delay: Duration,
    ) -> Result<DispatchHandle, DispatchError>;

    async fn revoke(&self, handle: &DispatchHandle) -> Result<(), DispatchError>;

    /// Bind `job_id` to `trigger`, replacing any previous binding for the job.
    async fn register_periodic(
        &self,
        job_id: &JobId,
        trigger: &PeriodicTrigger,
        enabled: bool,
    ) -> Result<(), DispatchError>;

    async fn set_periodic_enabled(
        &self,
        job_id: &JobId,
        trigger_id: TriggerId,
        enabled: bool,
    ) -> Result<(), DispatchError>;

    /// Drop the job's periodic binding entirely (job deleted or no longer
    /// recurring). [`DispatchError::UnknownBinding`] when there is none.
    async fn remove_periodic(&self, job_id: &JobId) -> Result<(), DispatchError>;
}
