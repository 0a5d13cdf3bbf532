use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use cronhooks_scheduler::types::DEFAULT_TIMEZONE;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::http::error::ApiResult;

const DEFAULT_PREVIEW_COUNT: usize = 5;

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub cron: String,
    pub timezone: Option<String>,
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub cron_expression: String,
    pub timezone: String,
    pub next_runs: Vec<DateTime<Utc>>,
}

/// GET /schedules/preview?cron=...&timezone=...&count=...
pub async fn preview(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PreviewQuery>, QueryRejection>,
) -> ApiResult<Json<PreviewResponse>> {
    let Query(q) = query?;
    let timezone = q
        .timezone
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let cron_expression = q.cron.trim().to_string();
    let next_runs = state.scheduler.preview(
        &cron_expression,
        &timezone,
        q.count.unwrap_or(DEFAULT_PREVIEW_COUNT),
    )?;
    Ok(Json(PreviewResponse {
        cron_expression,
        timezone,
        next_runs,
    }))
}
