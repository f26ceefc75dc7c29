//! Persistence-bound view of a job instance used while it executes.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::types::{JobInstance, JobStatus};

/// A handle onto the durable record of one job instance.
///
/// Every mutating call must be persisted before it returns so that a
/// concurrently polling observer never sees state older than the last write.
#[async_trait]
pub trait JobHandle: Send + Sync {
    /// Snapshot of the instance taken when the handle was resolved.
    fn instance(&self) -> &JobInstance;

    /// Current persisted status.
    async fn status(&self) -> Result<JobStatus, JobQueueError>;

    /// Move the instance from one of `from` to `to`.
    ///
    /// Returns `false` without writing when the persisted status is not in
    /// `from`, so a late writer can never regress an observed status.
    async fn transition(
        &self,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
    ) -> Result<bool, JobQueueError>;

    async fn append_log(&self, line: &str) -> Result<(), JobQueueError>;

    async fn set_progress(&self, percent: u8) -> Result<(), JobQueueError>;

    async fn set_progress_text(&self, markup: &str) -> Result<(), JobQueueError>;
}

/// Fetches the current instance of a job when a unit becomes eligible.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn resolve(&self, job_id: Uuid) -> Result<Arc<dyn JobHandle>, JobQueueError>;
}
