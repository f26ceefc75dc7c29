use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use jobhub_queue::{InstanceResolver, JobHandle, JobInstance, JobQueueError, JobStatus};

use crate::store::JobStore;

/// [`JobHandle`] that writes through to the [`JobStore`].
#[derive(Debug, Clone)]
pub struct StoredJobHandle {
    store: JobStore,
    instance: JobInstance,
}

impl StoredJobHandle {
    pub fn new(store: JobStore, instance: JobInstance) -> Self {
        Self { store, instance }
    }
}

#[async_trait]
impl JobHandle for StoredJobHandle {
    fn instance(&self) -> &JobInstance {
        &self.instance
    }

    async fn status(&self) -> Result<JobStatus, JobQueueError> {
        Ok(self.store.instance_status(self.instance.id).await?)
    }

    async fn transition(
        &self,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
    ) -> Result<bool, JobQueueError> {
        Ok(self
            .store
            .transition(self.instance.id, from, to, log_line)
            .await?)
    }

    async fn append_log(&self, line: &str) -> Result<(), JobQueueError> {
        Ok(self.store.append_log(self.instance.id, line).await?)
    }

    async fn set_progress(&self, percent: u8) -> Result<(), JobQueueError> {
        Ok(self.store.set_progress(self.instance.id, percent).await?)
    }

    async fn set_progress_text(&self, markup: &str) -> Result<(), JobQueueError> {
        Ok(self
            .store
            .set_progress_text(self.instance.id, markup)
            .await?)
    }
}

/// Resolves a job id to a handle on its current instance.
#[derive(Debug, Clone)]
pub struct StoreResolver {
    store: JobStore,
}

impl StoreResolver {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InstanceResolver for StoreResolver {
    async fn resolve(&self, job_id: Uuid) -> Result<Arc<dyn JobHandle>, JobQueueError> {
        let instance = self
            .store
            .current_instance(job_id)
            .await?
            .ok_or(JobQueueError::NotFound(job_id))?;
        Ok(Arc::new(StoredJobHandle::new(self.store.clone(), instance)))
    }
}
