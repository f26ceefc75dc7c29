use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::Value;

use crate::handlers::utils::{instance_to_payload, job_id_param};
use crate::{error::ApiError, state::AppState};

/// POST /jobs/{jobId}/rerun
pub async fn rerun(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let instance = state.engine.rerun(job_id).await?;
    Ok(Json(instance_to_payload(&instance)))
}
