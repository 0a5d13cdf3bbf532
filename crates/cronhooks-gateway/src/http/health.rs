use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// Short git commit hash embedded at compile time by build.rs.
pub const GIT_SHA: &str = env!("CRONHOOKS_GIT_SHA");

/// GET /health: liveness check, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": GIT_SHA,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "workers": state.config.queue.workers,
    }))
}
