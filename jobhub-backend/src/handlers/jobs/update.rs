use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::handlers::utils::{instance_to_payload, job_id_param, raw_args};
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct UpdateJobRequest {
    #[serde(default)]
    args: Option<Value>,
}

/// PUT /jobs/{jobId}
/// Replace the arguments of a job; the current instance is aborted first.
pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let request: UpdateJobRequest = serde_json::from_value(body)?;
    let raw = raw_args(request.args.as_ref())?;
    let instance = state.engine.update(job_id, raw).await?;
    Ok(Json(instance_to_payload(&instance)))
}
