//! Executor: one attempt of one job, plus the retry state machine.
//!
//! ```text
//! Pending ──2xx/3xx──▶ Success            (Once: job deactivated)
//!    │
//!    └──failure──▶ Failed ──n < max──▶ Retrying   (attempt n+1 enqueued)
//!                     │
//!                     └──n >= max──▶ Failed       (Once: job deactivated)
//! ```

use std::sync::Arc;
use std::time::Duration;

use cronhooks_core::JobId;
use tracing::{debug, error, info, warn};

use crate::caller::{truncate_utf8, WebhookCaller, ERROR_MESSAGE_LIMIT};
use crate::error::{ExecutionFailure, Result};
use crate::gateway::DispatchGateway;
use crate::schedule::retry_delay_secs;
use crate::store::{AttemptClaim, AttemptOutcome, AttemptStore, JobStore, WebhookStore};
use crate::types::{AttemptStatus, Job};

/// Why a delivery produced no attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Inactive,
    /// One-shot job that already succeeded; it was deactivated instead.
    AlreadySucceeded,
    /// Another worker is running the same one-shot attempt.
    DuplicateInFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub attempt_id: i64,
    pub attempt_number: u32,
    /// Final status of the attempt row.
    pub status: AttemptStatus,
    pub response_code: Option<u16>,
    pub failure: Option<ExecutionFailure>,
    /// Set when the next attempt was enqueued.
    pub retry_in: Option<Duration>,
    /// True when this attempt switched the job off.
    pub deactivated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Attempted(AttemptReport),
    Skipped(SkipReason),
}

pub struct Executor {
    store: Arc<dyn WebhookStore>,
    gateway: Arc<dyn DispatchGateway>,
    caller: Arc<dyn WebhookCaller>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        gateway: Arc<dyn DispatchGateway>,
        caller: Arc<dyn WebhookCaller>,
    ) -> Self {
        Self {
            store,
            gateway,
            caller,
        }
    }

    /// Run attempt `attempt_number` of `job_id`.
    ///
    /// Store errors propagate; call failures are recorded on the attempt and
    /// never returned as `Err`. If the outcome itself cannot be stored, the
    /// attempt is closed as failed on a best-effort basis so a redelivery is
    /// not blocked behind a pending row.
    pub async fn execute(&self, job_id: &JobId, attempt_number: u32) -> Result<ExecutionReport> {
        let Some(job) = self.store.get_job(job_id)? else {
            warn!(job_id = %job_id, "job not found, delivery dropped");
            return Ok(ExecutionReport::Skipped(SkipReason::NotFound));
        };
        if !job.is_active {
            debug!(job_id = %job_id, "job inactive, delivery dropped");
            return Ok(ExecutionReport::Skipped(SkipReason::Inactive));
        }

        let attempt = match self.store.begin_attempt(job_id, attempt_number)? {
            AttemptClaim::Started(attempt) => attempt,
            AttemptClaim::NotFound => return Ok(ExecutionReport::Skipped(SkipReason::NotFound)),
            AttemptClaim::Inactive => return Ok(ExecutionReport::Skipped(SkipReason::Inactive)),
            AttemptClaim::AlreadySucceeded => {
                error!(
                    job_id = %job_id,
                    name = %job.name,
                    "prevented re-execution of one-time job that already succeeded"
                );
                return Ok(ExecutionReport::Skipped(SkipReason::AlreadySucceeded));
            }
            AttemptClaim::InFlight => {
                warn!(job_id = %job_id, attempt = attempt_number, "duplicate delivery while attempt in flight");
                return Ok(ExecutionReport::Skipped(SkipReason::DuplicateInFlight));
            }
        };

        info!(job_id = %job_id, name = %job.name, attempt = attempt_number, "executing webhook");

        let (outcome, failure) = match self.caller.call(&job.target, job.timeout_secs).await {
            Ok(resp) if resp.is_success() => (
                AttemptOutcome {
                    status: AttemptStatus::Success,
                    response_code: Some(resp.status),
                    response_body: resp.body,
                    error_message: String::new(),
                },
                None,
            ),
            Ok(resp) => {
                let failure = ExecutionFailure::NonSuccessResponse {
                    status: resp.status,
                };
                (
                    AttemptOutcome {
                        status: AttemptStatus::Failed,
                        response_code: Some(resp.status),
                        response_body: resp.body,
                        error_message: failure.to_string(),
                    },
                    Some(failure),
                )
            }
            Err(failure) => (
                AttemptOutcome {
                    status: AttemptStatus::Failed,
                    response_code: None,
                    response_body: String::new(),
                    error_message: truncate_utf8(&failure.to_string(), ERROR_MESSAGE_LIMIT),
                },
                Some(failure),
            ),
        };

        let mut report = AttemptReport {
            attempt_id: attempt.id,
            attempt_number,
            status: outcome.status,
            response_code: outcome.response_code,
            failure: failure.clone(),
            retry_in: None,
            deactivated: false,
        };

        let Some(failure) = failure else {
            let deactivate = job.is_once();
            self.record(&job, attempt.id, &outcome, deactivate)?;
            report.deactivated = deactivate;
            info!(job_id = %job_id, status = ?outcome.response_code, deactivated = deactivate, "webhook delivered");
            return Ok(ExecutionReport::Attempted(report));
        };

        warn!(job_id = %job_id, attempt = attempt_number, code = failure.code(), "webhook attempt failed: {failure}");

        if attempt_number >= job.max_retries {
            let deactivate = job.is_once();
            self.record(&job, attempt.id, &outcome, deactivate)?;
            report.deactivated = deactivate;
            warn!(job_id = %job_id, attempts = attempt_number, deactivated = deactivate, "retries exhausted");
            return Ok(ExecutionReport::Attempted(report));
        }

        self.record(&job, attempt.id, &outcome, false)?;

        let delay = Duration::from_secs(retry_delay_secs(job.retry_base_delay_secs, attempt_number));
        match self
            .gateway
            .enqueue_after(job_id, attempt_number + 1, delay)
            .await
        {
            Ok(handle) => {
                self.store.mark_retrying(attempt.id)?;
                report.status = AttemptStatus::Retrying;
                report.retry_in = Some(delay);
                info!(job_id = %job_id, next_attempt = attempt_number + 1, delay_secs = delay.as_secs(), %handle, "retry scheduled");
            }
            Err(e) => {
                error!(job_id = %job_id, "could not enqueue retry: {e}");
                if job.is_once() {
                    self.store.set_active(job_id, false)?;
                    report.deactivated = true;
                }
            }
        }
        Ok(ExecutionReport::Attempted(report))
    }

    /// Store the outcome. On failure, close the attempt as Failed instead and
    /// switch a one-shot job off, then hand back the original error.
    fn record(
        &self,
        job: &Job,
        attempt_id: i64,
        outcome: &AttemptOutcome,
        deactivate: bool,
    ) -> Result<()> {
        let Err(e) = self
            .store
            .finish_attempt(attempt_id, &job.id, outcome, deactivate)
        else {
            return Ok(());
        };
        error!(job_id = %job.id, attempt_id, code = e.code(), "could not record attempt outcome: {e}");

        let fallback = AttemptOutcome {
            status: AttemptStatus::Failed,
            response_code: outcome.response_code,
            response_body: outcome.response_body.clone(),
            error_message: truncate_utf8(
                &format!("Attempt outcome could not be recorded: {e}"),
                ERROR_MESSAGE_LIMIT,
            ),
        };
        if let Err(e2) = self
            .store
            .finish_attempt(attempt_id, &job.id, &fallback, job.is_once())
        {
            warn!(job_id = %job.id, attempt_id, "fallback attempt close failed: {e2}");
            if job.is_once() {
                if let Err(e3) = self.store.set_active(&job.id, false) {
                    warn!(job_id = %job.id, "could not deactivate job: {e3}");
                }
            }
        }
        Err(e)
    }
}
