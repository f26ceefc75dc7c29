//! Job execution errors.

use jobhub_queue::JobQueueError;
use thiserror::Error;

/// Errors that may occur during job execution.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("backup failed: {0}")]
    BackupFailed(String),
}

impl From<JobError> for JobQueueError {
    fn from(err: JobError) -> Self {
        JobQueueError::ExecutionFailed(err.to_string())
    }
}
