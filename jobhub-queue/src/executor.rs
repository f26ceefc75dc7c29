//! Job executor trait for implementing job handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobQueueError;
use crate::reporter::ProgressReporter;

/// Trait for implementing job executors.
///
/// Job executors handle the actual execution of a unit. The reporter carries
/// the serialized arguments of the instance plus the interrupt flag.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Returns the job type this executor handles.
    fn job_type(&self) -> &str;

    /// Execute the job.
    ///
    /// Returns `Ok(())` on success, [`JobQueueError::Interrupted`] when the
    /// handler stopped because of an abort, or an error describing the failure.
    async fn execute(&self, reporter: ProgressReporter) -> Result<(), JobQueueError>;
}

/// Mapping from a job type name to its executor, handed to
/// [`QueueBackend::listen`](crate::QueueBackend::listen).
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub executor: Arc<dyn JobExecutor>,
}

impl JobDefinition {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            name: executor.job_type().to_owned(),
            executor,
        }
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A no-op executor that immediately completes jobs.
///
/// Useful in tests and as a placeholder for job types whose implementation
/// has not landed yet.
#[derive(Debug, Default, Clone)]
pub struct NoOpExecutor {
    job_type: String,
}

impl NoOpExecutor {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl JobExecutor for NoOpExecutor {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, _reporter: ProgressReporter) -> Result<(), JobQueueError> {
        Ok(())
    }
}
