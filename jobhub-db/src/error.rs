use thiserror::Error;
use uuid::Uuid;

use jobhub_queue::JobQueueError;

/// Errors raised by the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("job {0} already has an active instance")]
    ActiveInstanceExists(Uuid),

    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    /// Map a failed insert onto `ActiveInstanceExists` when the partial unique
    /// index rejected it.
    pub(crate) fn from_insert(err: sqlx::Error, job_id: Uuid) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::ActiveInstanceExists(job_id)
            }
            _ => Self::Sqlx(err),
        }
    }
}

impl From<StoreError> for JobQueueError {
    fn from(err: StoreError) -> Self {
        JobQueueError::Persistence(err.to_string())
    }
}
