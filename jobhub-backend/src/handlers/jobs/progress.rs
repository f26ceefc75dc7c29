use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::job_id_param;
use crate::{error::ApiError, state::AppState};

/// GET /jobs/{jobId}/progress
/// Poll feed; `refreshIntervalMs` is zero once the job stops changing.
pub async fn progress(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let progress = state.engine.query_progress(job_id).await?;
    let refresh = progress.refresh_interval().as_millis() as u64;

    Ok(Json(json!({
        "status": progress.status.as_str(),
        "progress": progress.progress,
        "progressText": progress.progress_text,
        "log": progress.log,
        "refreshIntervalMs": refresh,
    })))
}
