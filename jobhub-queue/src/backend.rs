//! The contract every queue backend implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobQueueError;
use crate::executor::JobDefinition;
use crate::handle::InstanceResolver;
use crate::types::JobInstance;

/// Pluggable transport that runs job instances asynchronously.
///
/// Units are keyed by `JobInstance::job_id`: at most one non-terminal unit
/// may exist per job at a time.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Activate the backend. Must be called exactly once, before any other
    /// operation.
    async fn listen(
        &self,
        definitions: Vec<JobDefinition>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Result<(), JobQueueError>;

    /// Enqueue a unit for execution, honouring `scheduled_at` when set.
    async fn add(&self, instance: &JobInstance) -> Result<(), JobQueueError>;

    /// Drop a unit that has not started yet.
    async fn remove(&self, instance: &JobInstance) -> Result<(), JobQueueError>;

    /// Request termination of a running unit. Returns once the request has
    /// been accepted; the final status is written by the executing side.
    async fn kill(&self, instance: &JobInstance) -> Result<(), JobQueueError>;

    /// Stop dispatching new units and interrupt in-flight ones.
    async fn shutdown(&self);

    /// Whether units outlive the process. For backends returning `false` the
    /// engine reconciles rows a previous process left behind on activation.
    fn is_durable(&self) -> bool {
        true
    }
}
