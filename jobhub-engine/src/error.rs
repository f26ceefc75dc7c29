use thiserror::Error;
use uuid::Uuid;

use jobhub_db::StoreError;
use jobhub_queue::{JobQueueError, JobStatus};

use crate::args::ValidationErrors;
use crate::codec::CodecError;

/// Registration failures. These are startup bugs and should stop the process.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job type `{0}` is already registered")]
    DuplicateJobType(String),

    #[error("cannot register job type `{0}`: the registry is frozen after activation")]
    RegistryFrozen(String),

    #[error("job type `{name}` is incomplete: {reason}")]
    Incomplete { name: String, reason: &'static str },
}

/// Errors surfaced by [`JobEngine`](crate::JobEngine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job type `{job_type}` of job {job_id} is no longer registered")]
    JobTypeNotRegistered { job_id: Uuid, job_type: String },

    #[error("job {job_id} is {status}, cannot {operation}")]
    IllegalTransition {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("job engine has not been activated")]
    NotActivated,

    #[error("job engine is already activated")]
    AlreadyActivated,

    #[error(transparent)]
    Queue(#[from] JobQueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}
