use axum::{http::StatusCode, response::IntoResponse, Json};
use jobhub_engine::{EngineError, JobQueueError, StoreError, ValidationErrors};
use serde_json::json;
use thiserror::Error;

type SerdeJsonError = serde_json::Error;

/// Top-level API error shared by all route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("validation error")]
    Validation(serde_json::Value),
    #[error(transparent)]
    SerdeJson(#[from] SerdeJsonError),
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::Validation(errors.to_payload())
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::IllegalTransition { .. } => StatusCode::CONFLICT,
        EngineError::Store(StoreError::ActiveInstanceExists(_)) => StatusCode::CONFLICT,
        EngineError::Queue(
            JobQueueError::AlreadyQueued(_)
            | JobQueueError::AlreadyStarted(_)
            | JobQueueError::NotRunning(_),
        ) => StatusCode::CONFLICT,
        EngineError::UnknownJobType(_) | EngineError::JobTypeNotRegistered { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::NotActivated | EngineError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Store(_)
        | EngineError::Codec(_)
        | EngineError::Registry(_)
        | EngineError::AlreadyActivated => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::Engine(e) => engine_status(e),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::SerdeJson(_) => StatusCode::BAD_REQUEST,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }

        let payload = match self {
            ApiError::Validation(v) => v,
            ApiError::Engine(EngineError::Validation(v)) => v.to_payload(),
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(payload)).into_response()
    }
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}
