//! Error types for the job queue system.

use thiserror::Error;
use uuid::Uuid;

/// Errors that may occur while interacting with a queue backend or while a
/// job handler executes.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue backend is unavailable")]
    Unavailable,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue backend is already listening")]
    AlreadyListening,

    #[error("queue backend has not been activated with listen()")]
    NotListening,

    #[error("no handler registered for job type `{0}`")]
    UnknownJobType(String),

    #[error("unknown job status `{0}`")]
    UnknownStatus(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {0} already has a queued or running unit")]
    AlreadyQueued(Uuid),

    #[error("job {0} has already started and cannot be removed")]
    AlreadyStarted(Uuid),

    #[error("job {0} is not running")]
    NotRunning(Uuid),

    #[error("job was interrupted")]
    Interrupted,

    #[error("failed to persist job state: {0}")]
    Persistence(String),

    #[error("job execution failed: {0}")]
    ExecutionFailed(String),
}

impl JobQueueError {
    /// Shorthand for handlers reporting a business failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }
}
