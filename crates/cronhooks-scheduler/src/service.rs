//! Management surface: the operations exposed to API clients.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronhooks_core::JobId;
use tracing::{info, instrument};

use crate::caller::merge_headers;
use crate::controller::Controller;
use crate::error::{Result, SchedulerError};
use crate::gateway::DispatchGateway;
use crate::planner::{check_schedule, Plan, Planner};
use crate::schedule::{next_fire_times, resolve_fire_at};
use crate::store::{AttemptStore, JobStore, WebhookStore};
use crate::types::{
    ExecutionAttempt, ExecutionSummary, Job, JobDefinition, JobFilter, Page, Schedule, ScheduleKind,
};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_CRON_LEN: usize = 100;
pub const MAX_TIMEZONE_LEN: usize = 50;
pub const MAX_RETRIES: u32 = 20;
/// One day.
pub const MAX_RETRY_BASE_DELAY_SECS: u64 = 86_400;
/// One hour.
pub const MAX_TIMEOUT_SECS: u64 = 3_600;
/// Upper bound on fire times returned by a schedule preview.
pub const MAX_PREVIEW: usize = 50;

/// Check a definition without persisting anything.
///
/// With `require_future`, a one-shot fire time at or before `now` is rejected;
/// otherwise only its timezone is checked.
pub fn validate_definition(
    def: &JobDefinition,
    now: DateTime<Utc>,
    require_future: bool,
) -> Result<()> {
    let name = def.name.trim();
    if name.is_empty() {
        return Err(SchedulerError::InvalidJob("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchedulerError::InvalidJob(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }

    if def.target.url.len() > MAX_URL_LEN {
        return Err(SchedulerError::InvalidJob(format!(
            "url longer than {MAX_URL_LEN} bytes"
        )));
    }
    let url = reqwest::Url::parse(&def.target.url)
        .map_err(|e| SchedulerError::InvalidJob(format!("invalid url {:?}: {e}", def.target.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SchedulerError::InvalidJob(format!(
            "url scheme must be http or https, got {}",
            url.scheme()
        )));
    }
    merge_headers(&def.target).map_err(|e| SchedulerError::InvalidJob(e.to_string()))?;

    if def.timeout_secs == 0 {
        return Err(SchedulerError::InvalidJob(
            "timeout must be at least 1 second".into(),
        ));
    }
    if def.timeout_secs > MAX_TIMEOUT_SECS {
        return Err(SchedulerError::InvalidJob(format!(
            "timeout must be at most {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    if def.max_retries > MAX_RETRIES {
        return Err(SchedulerError::InvalidJob(format!(
            "max_retries must be at most {MAX_RETRIES}"
        )));
    }
    if def.retry_base_delay_secs > MAX_RETRY_BASE_DELAY_SECS {
        return Err(SchedulerError::InvalidJob(format!(
            "retry_delay must be at most {MAX_RETRY_BASE_DELAY_SECS} seconds"
        )));
    }
    if def.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(SchedulerError::InvalidTimezone(def.timezone.clone()));
    }

    match &def.schedule {
        Schedule::Recurring { cron_expression } if cron_expression.len() > MAX_CRON_LEN => {
            Err(SchedulerError::InvalidCron(format!(
                "expression longer than {MAX_CRON_LEN} bytes"
            )))
        }
        Schedule::Once { fire_at } if !require_future => {
            resolve_fire_at(*fire_at, &def.timezone).map(|_| ())
        }
        schedule => check_schedule(schedule, &def.timezone, now),
    }
}

/// Facade over the store, planner and controller.
pub struct WebhookScheduler {
    store: Arc<dyn WebhookStore>,
    planner: Arc<Planner>,
    controller: Controller,
}

impl WebhookScheduler {
    pub fn new(store: Arc<dyn WebhookStore>, gateway: Arc<dyn DispatchGateway>) -> Self {
        let planner = Arc::new(Planner::new(store.clone(), gateway.clone()));
        let controller = Controller::new(store.clone(), gateway, planner.clone());
        Self {
            store,
            planner,
            controller,
        }
    }

    fn load(&self, id: &JobId) -> Result<Job> {
        self.store
            .get_job(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.clone() })
    }

    /// Validate, persist as active, and schedule.
    ///
    /// Invalid definitions leave no row behind. If planning fails after the
    /// insert, the job is kept but inactive and the error is returned.
    #[instrument(skip(self, def), fields(name = %def.name))]
    pub async fn create_job(&self, def: JobDefinition) -> Result<Job> {
        validate_definition(&def, Utc::now(), true)?;
        let job = self.store.insert_job(&def)?;
        self.planner.schedule(&job).await?;
        info!(job_id = %job.id, kind = %job.kind(), "job created");
        self.load(&job.id)
    }

    /// Replace a job's definition: cancel, rewrite, then reschedule if it
    /// was active before the update.
    #[instrument(skip(self, def), fields(job_id = %id))]
    pub async fn update_job(&self, id: &JobId, def: JobDefinition) -> Result<Job> {
        let current = self.load(id)?;
        let was_active = current.is_active;
        validate_definition(&def, Utc::now(), was_active)?;

        self.controller.cancel(id).await?;
        if current.kind() == ScheduleKind::Recurring && def.schedule.kind() == ScheduleKind::Once {
            self.controller.release_periodic(id).await;
        }
        if !self.store.replace_definition(id, &def)? {
            return Err(SchedulerError::JobNotFound { id: id.clone() });
        }
        if was_active {
            self.store.set_active(id, true)?;
            let job = self.load(id)?;
            self.planner.schedule(&job).await?;
        }
        info!(job_id = %id, rescheduled = was_active, "job updated");
        self.load(id)
    }

    /// Cancel, then delete the job, its periodic binding and its attempt
    /// history.
    pub async fn delete_job(&self, id: &JobId) -> Result<()> {
        let job = self.controller.cancel(id).await?;
        if job.kind() == ScheduleKind::Recurring {
            self.controller.release_periodic(id).await;
        }
        if !self.store.delete_job(id)? {
            return Err(SchedulerError::JobNotFound { id: id.clone() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Stop an active job. Cancelling an inactive job is an error.
    pub async fn cancel_job(&self, id: &JobId) -> Result<Job> {
        if !self.load(id)?.is_active {
            return Err(SchedulerError::AlreadyInactive { id: id.clone() });
        }
        self.controller.cancel(id).await
    }

    pub async fn reactivate_job(&self, id: &JobId) -> Result<Job> {
        let plan = self.controller.reactivate(id).await?;
        if let Plan::Recurring { trigger } = &plan {
            info!(job_id = %id, trigger_id = trigger.id, "recurring job resumed");
        }
        self.load(id)
    }

    /// Attempt history for a job, newest first.
    pub fn list_executions(&self, id: &JobId) -> Result<Vec<ExecutionAttempt>> {
        self.list_executions_page(id, Page::default())
    }

    pub fn list_executions_page(&self, id: &JobId, page: Page) -> Result<Vec<ExecutionAttempt>> {
        self.load(id)?;
        self.store.list_attempts_page(id, page)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.load(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter)
    }

    /// Attempt count and newest status for one job.
    pub fn execution_summary(&self, id: &JobId) -> Result<ExecutionSummary> {
        Ok(self
            .store
            .execution_summaries(Some(id))?
            .remove(id)
            .unwrap_or_default())
    }

    /// Summaries for every job that has attempts.
    pub fn execution_summaries(&self) -> Result<HashMap<JobId, ExecutionSummary>> {
        self.store.execution_summaries(None)
    }

    /// Next `count` fire instants of a cron cadence, capped at [`MAX_PREVIEW`].
    pub fn preview(
        &self,
        cron_expression: &str,
        timezone: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        next_fire_times(cron_expression, timezone, Utc::now(), count.min(MAX_PREVIEW))
    }
}
