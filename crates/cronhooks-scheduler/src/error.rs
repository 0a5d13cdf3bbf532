use chrono::{DateTime, Utc};
use cronhooks_core::JobId;
use thiserror::Error;

/// Errors surfaced by the scheduling engine to its callers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The one-shot fire time resolves to an instant that is not in the future.
    #[error("Schedule is in the past: {at}")]
    ScheduleInPast { at: DateTime<Utc> },

    /// The cron expression is not five valid cron fields.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// The timezone is not a known IANA zone name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Reactivation was requested for a job that is already active.
    #[error("Job is already active: {id}")]
    AlreadyActive { id: JobId },

    /// Cancellation was requested for a job that is already inactive.
    #[error("Job is already inactive: {id}")]
    AlreadyInactive { id: JobId },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// The job definition is malformed (missing URL, zero timeout, ...).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The dispatch gateway refused or failed an operation.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short error code string sent to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::ScheduleInPast { .. } => "SCHEDULE_IN_PAST",
            SchedulerError::InvalidCron(_) => "INVALID_CRON",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::AlreadyActive { .. } => "ALREADY_ACTIVE",
            SchedulerError::AlreadyInactive { .. } => "ALREADY_INACTIVE",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::Dispatch(_) => "DISPATCH_ERROR",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// True for errors caused by the caller's input rather than the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::ScheduleInPast { .. }
                | SchedulerError::InvalidCron(_)
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::AlreadyActive { .. }
                | SchedulerError::AlreadyInactive { .. }
                | SchedulerError::InvalidJob(_)
        )
    }
}

/// Errors from the task queue behind the dispatch gateway.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handle does not refer to a pending dispatch (already fired or revoked).
    #[error("Unknown dispatch handle: {0}")]
    UnknownHandle(String),

    /// No periodic binding exists for the job.
    #[error("No periodic dispatch registered for job {0}")]
    UnknownBinding(JobId),

    /// The periodic cadence could not be evaluated.
    #[error("Invalid periodic cadence: {0}")]
    InvalidCadence(String),

    #[error("Queue storage error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Why an outbound webhook call did not succeed.
///
/// Recorded on the execution attempt; every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error("Request timed out after {timeout_secs} seconds")]
    TransportTimeout { timeout_secs: u64 },

    #[error("{0}")]
    TransportError(String),

    #[error("Target responded with status {status}")]
    NonSuccessResponse { status: u16 },
}

impl ExecutionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionFailure::TransportTimeout { .. } => "TRANSPORT_TIMEOUT",
            ExecutionFailure::TransportError(_) => "TRANSPORT_ERROR",
            ExecutionFailure::NonSuccessResponse { .. } => "NON_SUCCESS_RESPONSE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
