//! Schedule Planner: turns a job's declared schedule into queue state.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{error, info, instrument};

use crate::error::{Result, SchedulerError};
use crate::gateway::DispatchGateway;
use crate::registry::{PeriodicTrigger, TriggerRegistry};
use crate::schedule::{parse_timezone, resolve_fire_at, CronFields};
use crate::store::{JobStore, WebhookStore};
use crate::types::{DispatchHandle, Job, Schedule, DEFAULT_TIMEZONE};

/// What the planner set up for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Once {
        handle: DispatchHandle,
        fire_at: DateTime<Utc>,
    },
    Recurring {
        trigger: PeriodicTrigger,
    },
}

/// Validate a schedule without touching any state.
///
/// Catches everything [`Planner::schedule`] would reject, so callers can
/// refuse a definition before persisting it.
pub fn check_schedule(schedule: &Schedule, timezone: &str, now: DateTime<Utc>) -> Result<()> {
    match schedule {
        Schedule::Once { fire_at } => {
            future_fire_at(*fire_at, timezone, now)?;
        }
        Schedule::Recurring { cron_expression } => {
            CronFields::parse(cron_expression)?;
            parse_timezone(zone_or_default(timezone))?;
        }
    }
    Ok(())
}

/// Resolve a one-shot fire time and require it to be strictly after `now`.
pub fn future_fire_at(
    fire_at: NaiveDateTime,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let at = resolve_fire_at(fire_at, timezone)?;
    if at <= now {
        return Err(SchedulerError::ScheduleInPast { at });
    }
    Ok(at)
}

fn zone_or_default(timezone: &str) -> &str {
    if timezone.is_empty() {
        DEFAULT_TIMEZONE
    } else {
        timezone
    }
}

pub struct Planner {
    store: Arc<dyn WebhookStore>,
    gateway: Arc<dyn DispatchGateway>,
}

impl Planner {
    pub fn new(store: Arc<dyn WebhookStore>, gateway: Arc<dyn DispatchGateway>) -> Self {
        Self { store, gateway }
    }

    /// Plan `job` according to its schedule.
    ///
    /// On failure the job is deactivated so no active job is ever left
    /// without a dispatch handle or trigger.
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind()))]
    pub async fn schedule(&self, job: &Job) -> Result<Plan> {
        let planned = match &job.schedule {
            Schedule::Once { fire_at } => self.schedule_once(job, *fire_at).await,
            Schedule::Recurring { cron_expression } => {
                self.schedule_recurring(job, cron_expression).await
            }
        };
        if let Err(e) = &planned {
            if job.is_active {
                if let Err(deactivate_err) = self.store.set_active(&job.id, false) {
                    error!(job_id = %job.id, "could not deactivate unplannable job: {deactivate_err}");
                }
            }
            info!(job_id = %job.id, code = e.code(), "job not scheduled: {e}");
        }
        planned
    }

    async fn schedule_once(&self, job: &Job, fire_at: NaiveDateTime) -> Result<Plan> {
        let at = future_fire_at(fire_at, &job.timezone, Utc::now())?;
        let handle = self.gateway.enqueue_at(&job.id, at).await?;
        self.store.set_dispatch_handle(&job.id, Some(&handle))?;
        info!(job_id = %job.id, fire_at = %at, %handle, "one-time job scheduled");
        Ok(Plan::Once {
            handle,
            fire_at: at,
        })
    }

    async fn schedule_recurring(&self, job: &Job, cron_expression: &str) -> Result<Plan> {
        let fields = CronFields::parse(cron_expression)?;
        let timezone = zone_or_default(&job.timezone);
        parse_timezone(timezone)?;

        let trigger = self.store.register_or_reuse(&fields, timezone)?;
        self.gateway
            .register_periodic(&job.id, &trigger, job.is_active)
            .await?;
        self.store.set_periodic_handle(&job.id, Some(trigger.id))?;
        let enabled = self.store.refresh_enabled(trigger.id)?;
        info!(
            job_id = %job.id,
            trigger_id = trigger.id,
            cron = %fields.expression(),
            %timezone,
            enabled,
            "recurring job bound to periodic trigger"
        );
        Ok(Plan::Recurring {
            trigger: PeriodicTrigger { enabled, ..trigger },
        })
    }
}
