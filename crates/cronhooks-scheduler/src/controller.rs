//! Cancellation and reactivation.
//!
//! Queue-side cleanup is best-effort: a dispatch that slips through is
//! dropped by the executor because `is_active` is already false.

use std::sync::Arc;

use chrono::Utc;
use cronhooks_core::JobId;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result, SchedulerError};
use crate::gateway::DispatchGateway;
use crate::planner::{future_fire_at, Plan, Planner};
use crate::registry::TriggerRegistry;
use crate::store::{JobStore, WebhookStore};
use crate::types::{Job, Schedule};

pub struct Controller {
    store: Arc<dyn WebhookStore>,
    gateway: Arc<dyn DispatchGateway>,
    planner: Arc<Planner>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        gateway: Arc<dyn DispatchGateway>,
        planner: Arc<Planner>,
    ) -> Self {
        Self {
            store,
            gateway,
            planner,
        }
    }

    fn load(&self, id: &JobId) -> Result<Job> {
        self.store
            .get_job(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.clone() })
    }

    /// Stop a job from firing. Safe to call on an already-cancelled job.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        let job = self.load(id)?;
        self.store.set_active(id, false)?;

        match job.schedule {
            Schedule::Once { .. } => {
                if let Some(handle) = &job.dispatch_handle {
                    if let Err(e) = self.gateway.revoke(handle).await {
                        warn!(job_id = %id, %handle, "revoke failed, relying on inactive flag: {e}");
                    }
                    self.store.set_dispatch_handle(id, None)?;
                }
            }
            Schedule::Recurring { .. } => {
                if let Some(trigger_id) = job.periodic_handle {
                    if let Err(e) = self.gateway.set_periodic_enabled(id, trigger_id, false).await {
                        warn!(job_id = %id, trigger_id, "disabling periodic dispatch failed: {e}");
                    }
                    let still_enabled = self.store.refresh_enabled(trigger_id)?;
                    info!(job_id = %id, trigger_id, still_enabled, "periodic trigger refreshed");
                }
            }
        }

        info!(job_id = %id, "job cancelled");
        self.load(id)
    }

    /// Drop the job's periodic binding from the queue, once it is deleted or
    /// no longer recurring. Best-effort; a missing binding is fine.
    pub async fn release_periodic(&self, id: &JobId) {
        match self.gateway.remove_periodic(id).await {
            Ok(()) => info!(job_id = %id, "periodic binding removed"),
            Err(DispatchError::UnknownBinding(_)) => {
                debug!(job_id = %id, "no periodic binding to remove")
            }
            Err(e) => warn!(job_id = %id, "removing periodic binding failed: {e}"),
        }
    }

    /// Resume an inactive job with a fresh dispatch or trigger binding.
    pub async fn reactivate(&self, id: &JobId) -> Result<Plan> {
        let job = self.load(id)?;
        if job.is_active {
            return Err(SchedulerError::AlreadyActive { id: id.clone() });
        }
        if let Schedule::Once { fire_at } = &job.schedule {
            future_fire_at(*fire_at, &job.timezone, Utc::now())?;
        }

        self.store.set_active(id, true)?;
        let job = Job {
            is_active: true,
            ..job
        };
        let plan = self.planner.schedule(&job).await?;
        info!(job_id = %id, "job reactivated");
        Ok(plan)
    }
}
