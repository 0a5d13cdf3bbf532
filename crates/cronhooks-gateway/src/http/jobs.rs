//! Job management endpoints.
//!
//! The wire shape (`http_method`, `payload`, `schedule_type`, `scheduled_at`,
//! `retry_delay`, `timeout`) is the flat form API clients send; it is mapped
//! onto [`JobDefinition`] here.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use cronhooks_core::JobId;
use cronhooks_scheduler::schedule::parse_wall_clock;
use cronhooks_scheduler::types::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_TIMEZONE,
};
use cronhooks_scheduler::{
    AttemptStatus, ExecutionAttempt, ExecutionSummary, HttpMethod, Job, JobDefinition, JobFilter,
    Page, Schedule, ScheduleKind, SchedulerError, WebhookTarget,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppState;
use crate::http::error::ApiResult;

/// Page size of `GET /jobs/{id}/executions` when `limit` is absent.
pub const DEFAULT_EXECUTIONS_LIMIT: usize = 50;
pub const MAX_EXECUTIONS_LIMIT: usize = 200;

/// Body of `POST /jobs` and `PUT /jobs/{id}`.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub http_method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
    pub schedule_type: ScheduleKind,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, |s| s.trim().is_empty())
}

impl JobRequest {
    pub fn into_definition(self) -> Result<JobDefinition, SchedulerError> {
        let method: HttpMethod = self.http_method.parse().map_err(SchedulerError::InvalidJob)?;

        let schedule = match self.schedule_type {
            ScheduleKind::Once => {
                if !blank(&self.cron_expression) {
                    return Err(SchedulerError::InvalidJob(
                        "cron_expression must not be set for a one-time job".into(),
                    ));
                }
                let raw = self.scheduled_at.as_deref().unwrap_or("").trim();
                if raw.is_empty() {
                    return Err(SchedulerError::InvalidJob(
                        "scheduled_at is required for a one-time job".into(),
                    ));
                }
                Schedule::Once {
                    fire_at: parse_wall_clock(raw)?,
                }
            }
            ScheduleKind::Recurring => {
                if !blank(&self.scheduled_at) {
                    return Err(SchedulerError::InvalidJob(
                        "scheduled_at must not be set for a recurring job".into(),
                    ));
                }
                let cron_expression = self
                    .cron_expression
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| {
                        SchedulerError::InvalidJob(
                            "cron_expression is required for a recurring job".into(),
                        )
                    })?;
                Schedule::Recurring {
                    cron_expression: cron_expression.trim().to_string(),
                }
            }
        };

        Ok(JobDefinition {
            name: self.name.trim().to_string(),
            target: WebhookTarget {
                method,
                url: self.url.trim().to_string(),
                headers: self.headers,
                body: self.payload,
            },
            schedule,
            timezone: self
                .timezone
                .filter(|tz| !tz.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_base_delay_secs: self.retry_delay.unwrap_or(DEFAULT_RETRY_BASE_DELAY_SECS),
            timeout_secs: self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }
}

/// Job as returned to clients, in the same flat shape as [`JobRequest`].
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub name: String,
    pub url: String,
    pub http_method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    pub schedule_type: ScheduleKind,
    /// Wall clock in `timezone`.
    pub scheduled_at: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub is_active: bool,
    pub max_retries: u32,
    pub retry_delay: u64,
    pub timeout: u64,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub last_execution_status: Option<AttemptStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobResponse {
    pub fn new(job: Job, summary: ExecutionSummary) -> Self {
        let schedule_type = job.kind();
        let (scheduled_at, cron_expression) = match job.schedule {
            Schedule::Once { fire_at } => {
                (Some(fire_at.format("%Y-%m-%dT%H:%M:%S").to_string()), None)
            }
            Schedule::Recurring { cron_expression } => (None, Some(cron_expression)),
        };
        Self {
            id: job.id,
            name: job.name,
            url: job.target.url,
            http_method: job.target.method,
            headers: job.target.headers,
            payload: job.target.body,
            schedule_type,
            scheduled_at,
            cron_expression,
            timezone: job.timezone,
            is_active: job.is_active,
            max_retries: job.max_retries,
            retry_delay: job.retry_base_delay_secs,
            timeout: job.timeout_secs,
            last_execution_at: job.last_execution_at,
            execution_count: summary.execution_count,
            last_execution_status: summary.last_execution_status,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

fn job_id(raw: &str) -> ApiResult<JobId> {
    Ok(JobId::parse(raw)?)
}

fn respond(state: &AppState, job: Job) -> ApiResult<Json<JobResponse>> {
    let summary = state.scheduler.execution_summary(&job.id)?;
    Ok(Json(JobResponse::new(job, summary)))
}

/// Query of `GET /jobs`; every field is an optional equality filter.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub schedule_type: Option<ScheduleKind>,
    pub is_active: Option<bool>,
    pub http_method: Option<String>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, SchedulerError> {
        let method = self
            .http_method
            .filter(|m| !m.trim().is_empty())
            .map(|m| m.parse::<HttpMethod>())
            .transpose()
            .map_err(SchedulerError::InvalidJob)?;
        Ok(JobFilter {
            schedule_kind: self.schedule_type,
            is_active: self.is_active,
            method,
        })
    }
}

/// Query of `GET /jobs/{id}/executions`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ExecutionsQuery {
    fn page(&self) -> Page {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_EXECUTIONS_LIMIT)
            .min(MAX_EXECUTIONS_LIMIT);
        Page::new(limit, self.offset)
    }
}

/// GET /jobs?schedule_type=&is_active=&http_method=
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<JobResponse>>> {
    let Query(q) = query?;
    let jobs = state.scheduler.list_jobs(&q.into_filter()?)?;
    let mut summaries = state.scheduler.execution_summaries()?;
    Ok(Json(
        jobs.into_iter()
            .map(|job| {
                let summary = summaries.remove(&job.id).unwrap_or_default();
                JobResponse::new(job, summary)
            })
            .collect(),
    ))
}

/// POST /jobs: 201 with the scheduled job.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let Json(req) = body?;
    let job = state.scheduler.create_job(req.into_definition()?).await?;
    Ok((StatusCode::CREATED, respond(&state, job)?))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.scheduler.get_job(&job_id(&id)?)?;
    respond(&state, job)
}

/// PUT /jobs/{id}: cancel, rewrite, reschedule if it was active.
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<Json<JobResponse>> {
    let id = job_id(&id)?;
    let Json(req) = body?;
    let job = state
        .scheduler
        .update_job(&id, req.into_definition()?)
        .await?;
    respond(&state, job)
}

/// DELETE /jobs/{id}: 204.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.scheduler.delete_job(&job_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/{id}/cancel: 400 if the job is already inactive.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.scheduler.cancel_job(&job_id(&id)?).await?;
    respond(&state, job)
}

/// POST /jobs/{id}/activate
pub async fn activate_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.scheduler.reactivate_job(&job_id(&id)?).await?;
    respond(&state, job)
}

/// GET /jobs/{id}/executions?limit=&offset=: newest first.
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<ExecutionsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ExecutionAttempt>>> {
    let Query(q) = query?;
    let attempts = state
        .scheduler
        .list_executions_page(&job_id(&id)?, q.page())?;
    Ok(Json(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> JobRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn once_request_maps_to_definition_with_defaults() {
        let def = request(json!({
            "name": " Reminder ",
            "url": "https://example.com/hook",
            "schedule_type": "once",
            "scheduled_at": "2030-05-01T08:00:00+02:00",
            "timezone": "Europe/Rome"
        }))
        .into_definition()
        .unwrap();

        assert_eq!(def.name, "Reminder");
        assert_eq!(def.target.method, HttpMethod::Post);
        assert_eq!(def.timezone, "Europe/Rome");
        assert_eq!(def.max_retries, 3);
        assert_eq!(def.retry_base_delay_secs, 60);
        assert_eq!(def.timeout_secs, 30);
        match def.schedule {
            Schedule::Once { fire_at } => {
                assert_eq!(fire_at.format("%Y-%m-%d %H:%M").to_string(), "2030-05-01 08:00")
            }
            other => panic!("unexpected schedule {other:?}"),
        }
    }

    #[test]
    fn schedule_fields_must_match_schedule_type() {
        let both = request(json!({
            "name": "x", "url": "https://e.com", "schedule_type": "recurring",
            "cron_expression": "* * * * *", "scheduled_at": "2030-01-01T00:00:00"
        }));
        assert!(matches!(both.into_definition(), Err(SchedulerError::InvalidJob(_))));

        let missing = request(json!({
            "name": "x", "url": "https://e.com", "schedule_type": "once"
        }));
        assert!(matches!(missing.into_definition(), Err(SchedulerError::InvalidJob(_))));

        let cron_on_once = request(json!({
            "name": "x", "url": "https://e.com", "schedule_type": "once",
            "scheduled_at": "2030-01-01T00:00:00", "cron_expression": "0 * * * *"
        }));
        assert!(matches!(cron_on_once.into_definition(), Err(SchedulerError::InvalidJob(_))));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let req = request(json!({
            "name": "x", "url": "https://e.com", "http_method": "TRACE",
            "schedule_type": "recurring", "cron_expression": "0 * * * *"
        }));
        assert!(matches!(req.into_definition(), Err(SchedulerError::InvalidJob(_))));
    }

    #[test]
    fn blank_timezone_falls_back_to_utc() {
        let def = request(json!({
            "name": "x", "url": "https://e.com", "http_method": "get",
            "schedule_type": "recurring", "cron_expression": " 0 * * * * ", "timezone": ""
        }))
        .into_definition()
        .unwrap();
        assert_eq!(def.timezone, "UTC");
        assert_eq!(def.target.method, HttpMethod::Get);
        assert_eq!(
            def.schedule,
            Schedule::Recurring {
                cron_expression: "0 * * * *".into()
            }
        );
    }

    #[test]
    fn list_query_maps_to_filter() {
        let q: ListJobsQuery = serde_json::from_value(json!({
            "schedule_type": "recurring", "is_active": true, "http_method": "get"
        }))
        .unwrap();
        assert_eq!(
            q.into_filter().unwrap(),
            JobFilter {
                schedule_kind: Some(ScheduleKind::Recurring),
                is_active: Some(true),
                method: Some(HttpMethod::Get),
            }
        );

        let bad = ListJobsQuery {
            http_method: Some("BREW".into()),
            ..Default::default()
        };
        assert!(matches!(bad.into_filter(), Err(SchedulerError::InvalidJob(_))));
    }

    #[test]
    fn executions_page_defaults_and_caps_the_limit() {
        assert_eq!(
            ExecutionsQuery::default().page(),
            Page::new(DEFAULT_EXECUTIONS_LIMIT, 0)
        );
        let big = ExecutionsQuery {
            limit: Some(10_000),
            offset: 7,
        };
        assert_eq!(big.page(), Page::new(MAX_EXECUTIONS_LIMIT, 7));
    }
}
