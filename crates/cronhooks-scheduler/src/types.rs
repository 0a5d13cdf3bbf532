use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use cronhooks_core::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Row id of a deduplicated periodic trigger.
pub type TriggerId = i64;

/// Which of the two schedule shapes a job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Once,
    Recurring,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleKind::Once => "once",
            ScheduleKind::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleKind::Once),
            "recurring" => Ok(ScheduleKind::Recurring),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// When a job fires.
///
/// `fire_at` is a wall-clock time in the job's timezone, not an instant; the
/// planner resolves it to UTC at scheduling time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Once { fire_at: NaiveDateTime },
    Recurring { cron_expression: String },
}

impl Schedule {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Once { .. } => ScheduleKind::Once,
            Schedule::Recurring { .. } => ScheduleKind::Recurring,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

/// The outbound request a job performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub method: HttpMethod,
    pub url: String,
    /// Caller-supplied headers; merged over the defaults at call time.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body; sent only when non-empty.
    #[serde(default)]
    pub body: Value,
}

/// Opaque cancellation token returned by the dispatch gateway for a deferred dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchHandle(pub String);

impl DispatchHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a caller may set when creating or updating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub target: WebhookTarget,
    pub schedule: Schedule,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_base_delay_secs() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_SECS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub schedule: Schedule,
    /// IANA zone the schedule is expressed in.
    pub timezone: String,
    pub target: WebhookTarget,
    /// Authoritative gate: the executor never runs an inactive job.
    pub is_active: bool,
    /// Pending deferred dispatch (Once jobs only).
    pub dispatch_handle: Option<DispatchHandle>,
    /// Periodic trigger the job is bound to (Recurring jobs only).
    pub periodic_handle: Option<TriggerId>,
    /// Attempt-count ceiling; attempt 1 counts toward it.
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub timeout_secs: u64,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn kind(&self) -> ScheduleKind {
        self.schedule.kind()
    }

    pub fn is_once(&self) -> bool {
        self.kind() == ScheduleKind::Once
    }
}

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Call in flight.
    Pending,
    Success,
    /// Terminal failure for this attempt (no retry scheduled).
    Failed,
    /// Failed, and the next attempt has been enqueued.
    Retrying,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            "retrying" => Ok(AttemptStatus::Retrying),
            other => Err(format!("unknown attempt status: {other}")),
        }
    }
}

/// One recorded try at invoking a job's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: i64,
    pub job_id: JobId,
    pub status: AttemptStatus,
    /// 1-based; assigned by whoever dispatched the attempt.
    pub attempt_number: u32,
    pub response_code: Option<u16>,
    /// First 10 000 bytes of the response body.
    pub response_body: String,
    /// First 1 000 bytes of the failure description.
    pub error_message: String,
    pub executed_at: DateTime<Utc>,
}

/// Derived per-job view of its attempt history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub execution_count: u64,
    /// Status of the newest attempt, if any.
    pub last_execution_status: Option<AttemptStatus>,
}

/// Optional equality filters for job listings; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobFilter {
    pub schedule_kind: Option<ScheduleKind>,
    pub is_active: Option<bool>,
    pub method: Option<HttpMethod>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.schedule_kind.map_or(true, |k| job.kind() == k)
            && self.is_active.map_or(true, |a| job.is_active == a)
            && self.method.map_or(true, |m| job.target.method == m)
    }
}

/// Window into a newest-first listing. `limit: None` returns everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }
}
