use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::handlers::utils::raw_args;
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    job_type: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    schedule_at: Option<DateTime<Utc>>,
}

/// POST /jobs
/// Submit a job; `scheduleAt` in the future defers it.
pub async fn submit(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: SubmitJobRequest = serde_json::from_value(body)?;
    if request.job_type.trim().is_empty() {
        return Err(ApiError::bad_request("jobType must not be empty"));
    }
    let raw = raw_args(request.args.as_ref())?;

    let job_id = match request.schedule_at {
        Some(at) => state.engine.submit_at(&request.job_type, raw, at).await?,
        None => state.engine.submit(&request.job_type, raw).await?,
    };

    Ok((StatusCode::CREATED, Json(json!({ "id": job_id }))))
}
