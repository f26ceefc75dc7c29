use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Extension, Query};
use axum::Json;
use jobhub_engine::JobFilter;
use serde_json::{json, Value};

use crate::handlers::utils::{job_to_payload, parse_positive_usize, parse_status};
use crate::{error::ApiError, state::AppState};

const MAX_PER_PAGE: usize = 100;

/// GET /jobs
/// List jobs, newest first, with optional status filter and pagination.
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let params = query.ok().map(|value| value.0).unwrap_or_default();
    let page = parse_positive_usize(params.get("page"), 1, "page")?;
    let per_page = parse_positive_usize(params.get("perPage"), 20, "perPage")?;
    let status = parse_status(params.get("status"))?;
    if per_page > MAX_PER_PAGE {
        return Err(ApiError::bad_request(format!(
            "perPage must be at most {MAX_PER_PAGE}"
        )));
    }

    let offset = (page - 1)
        .checked_mul(per_page)
        .and_then(|offset| i64::try_from(offset).ok())
        .ok_or_else(|| ApiError::bad_request("pagination parameters too large"))?;
    let filter = JobFilter {
        status,
        limit: i64::try_from(per_page).unwrap_or(i64::MAX),
        offset,
    };
    let (jobs, total) = state.engine.list_jobs(&filter).await?;
    let items: Vec<Value> = jobs.iter().map(job_to_payload).collect();

    Ok(Json(json!({
        "items": items,
        "pagination": {
            "page": page,
            "perPage": per_page,
            "total": total,
        }
    })))
}
