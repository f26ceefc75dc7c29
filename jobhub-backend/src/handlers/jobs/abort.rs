use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::job_id_param;
use crate::{error::ApiError, state::AppState};

/// POST /jobs/{jobId}/abort
/// A pending job is cancelled at once; a running one is asked to stop and
/// the response reports `killRequested`.
pub async fn abort(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let outcome = state.engine.abort(job_id).await?;
    Ok(Json(json!({ "id": job_id, "outcome": outcome })))
}
