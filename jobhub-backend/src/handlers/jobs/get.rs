use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::{instance_to_payload, job_id_param, job_to_payload};
use crate::{error::ApiError, state::AppState};

/// GET /jobs/{jobId}
pub async fn get(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let job_id = job_id_param(&path)?;
    let detail = state.engine.job(job_id).await?;
    let registered = detail.type_registered();

    let mut payload = job_to_payload(&detail.job);
    payload["instance"] = detail
        .instance
        .as_ref()
        .map(instance_to_payload)
        .unwrap_or(Value::Null);
    payload["jobTypeInfo"] = json!(detail.job_type);
    payload["typeRegistered"] = json!(registered);
    Ok(Json(payload))
}
