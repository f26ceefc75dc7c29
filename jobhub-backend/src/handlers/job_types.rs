use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// GET /job-types
/// List the job types this process can run.
pub async fn list(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let items = state.engine.job_types();
    Ok(Json(json!({ "items": items })))
}
