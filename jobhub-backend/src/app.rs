use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit, extract::Extension, http::StatusCode, response::IntoResponse,
    routing::get, routing::post, Router,
};

use crate::handlers::{job_types, jobs};
use crate::state::AppState;

// Job arguments are small JSON objects.
const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Build the primary axum router with the provided shared application state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/job-types", get(job_types::list))
        .route("/jobs", get(jobs::list::list).post(jobs::submit::submit))
        .route(
            "/jobs/{jobId}",
            get(jobs::get::get).put(jobs::update::update),
        )
        .route("/jobs/{jobId}/progress", get(jobs::progress::progress))
        .route("/jobs/{jobId}/instances", get(jobs::instances::list))
        .route("/jobs/{jobId}/abort", post(jobs::abort::abort))
        .route("/jobs/{jobId}/rerun", post(jobs::rerun::rerun));
    // health and readiness endpoints
    let router = router
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
        .layer(Extension(state));

    Router::new().nest("/api", router)
}

async fn health_handler() -> impl IntoResponse {
    // Liveness: always return 200 OK when process is alive.
    (StatusCode::OK, "OK")
}

async fn ready_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    // Readiness: workers are listening and the database answers.
    if !state.engine.is_activated() {
        return (StatusCode::SERVICE_UNAVAILABLE, "workers not started");
    }
    match state.engine.store().ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(error) => {
            tracing::warn!(%error, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}
