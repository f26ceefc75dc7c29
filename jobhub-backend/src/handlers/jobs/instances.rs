use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::{instance_to_payload, job_id_param};
use crate::{error::ApiError, state::AppState};

/// GET /jobs/{jobId}/instances
/// Every execution attempt of a job, oldest first.
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let history = state.engine.history(job_id).await?;
    let items: Vec<Value> = history.iter().map(instance_to_payload).collect();
    Ok(Json(json!({ "items": items })))
}
