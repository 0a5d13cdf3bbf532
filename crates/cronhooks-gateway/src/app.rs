use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use cronhooks_core::config::CronhooksConfig;
use cronhooks_scheduler::WebhookScheduler;

use crate::http::{health, jobs, schedules};

/// Shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CronhooksConfig,
    pub scheduler: WebhookScheduler,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: CronhooksConfig, scheduler: WebhookScheduler) -> Self {
        Self {
            config,
            scheduler,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the management API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/jobs/{id}",
            get(jobs::get_job).put(jobs::update_job).delete(jobs::delete_job),
        )
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/activate", post(jobs::activate_job))
        .route("/jobs/{id}/executions", get(jobs::list_executions))
        .route("/schedules/preview", get(schedules::preview))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
