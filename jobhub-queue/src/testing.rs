//! In-memory doubles for exercising queue backends without a database.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::executor::JobExecutor;
use crate::handle::{InstanceResolver, JobHandle};
use crate::reporter::ProgressReporter;
use crate::types::{JobInstance, JobStatus};

/// A [`JobHandle`] that keeps the instance in process memory.
#[derive(Debug)]
pub struct MemoryHandle {
    initial: JobInstance,
    current: Mutex<JobInstance>,
}

impl MemoryHandle {
    pub fn new(instance: JobInstance) -> Self {
        Self {
            current: Mutex::new(instance.clone()),
            initial: instance,
        }
    }

    pub fn snapshot(&self) -> JobInstance {
        self.lock().clone()
    }

    pub fn force_status(&self, status: JobStatus) {
        self.lock().status = status;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobInstance> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn push_line(log: &mut String, line: &str) {
    if !log.is_empty() {
        log.push('\n');
    }
    log.push_str(line);
}

#[async_trait]
impl JobHandle for MemoryHandle {
    fn instance(&self) -> &JobInstance {
        &self.initial
    }

    async fn status(&self) -> Result<JobStatus, JobQueueError> {
        Ok(self.lock().status)
    }

    async fn transition(
        &self,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
    ) -> Result<bool, JobQueueError> {
        let mut inst = self.lock();
        if !from.contains(&inst.status) {
            return Ok(false);
        }
        let now = Utc::now();
        inst.status = to;
        inst.updated_at = now;
        if to == JobStatus::Running {
            inst.started_at = Some(now);
        }
        if to.is_terminal() {
            inst.finished_at = Some(now);
        }
        if let Some(line) = log_line {
            push_line(&mut inst.log, line);
        }
        Ok(true)
    }

    async fn append_log(&self, line: &str) -> Result<(), JobQueueError> {
        push_line(&mut self.lock().log, line);
        Ok(())
    }

    async fn set_progress(&self, percent: u8) -> Result<(), JobQueueError> {
        self.lock().progress = percent;
        Ok(())
    }

    async fn set_progress_text(&self, markup: &str) -> Result<(), JobQueueError> {
        self.lock().progress_text = markup.to_owned();
        Ok(())
    }
}

/// Resolver backed by a map of job id to handle.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    handles: DashMap<Uuid, Arc<MemoryHandle>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance` as the current instance of its job and return its
    /// handle.
    pub fn insert(&self, instance: JobInstance) -> Arc<MemoryHandle> {
        let handle = Arc::new(MemoryHandle::new(instance));
        self.handles.insert(handle.initial.job_id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, job_id: Uuid) -> Option<Arc<MemoryHandle>> {
        self.handles.get(&job_id).map(|h| Arc::clone(h.value()))
    }
}

#[async_trait]
impl InstanceResolver for MemoryResolver {
    async fn resolve(&self, job_id: Uuid) -> Result<Arc<dyn JobHandle>, JobQueueError> {
        self.get(job_id)
            .map(|h| h as Arc<dyn JobHandle>)
            .ok_or(JobQueueError::NotFound(job_id))
    }
}

#[derive(Debug, Clone)]
enum Behaviour {
    Ok,
    Fail(String),
    Panic(String),
    Interruptible,
    Sleep(Duration),
}

/// Executor with a fixed outcome.
#[derive(Debug, Clone)]
pub struct StaticExecutor {
    job_type: String,
    behaviour: Behaviour,
}

impl StaticExecutor {
    fn with(behaviour: Behaviour) -> Self {
        Self {
            job_type: "test".to_owned(),
            behaviour,
        }
    }

    pub fn ok() -> Self {
        Self::with(Behaviour::Ok)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::with(Behaviour::Fail(message.into()))
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::with(Behaviour::Panic(message.into()))
    }

    /// Blocks until interrupted, then returns `Interrupted`.
    pub fn interruptible() -> Self {
        Self::with(Behaviour::Interruptible)
    }

    /// Sleeps, reporting progress, unless interrupted first.
    pub fn sleep(duration: Duration) -> Self {
        Self::with(Behaviour::Sleep(duration))
    }

    pub fn named(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }
}

#[async_trait]
impl JobExecutor for StaticExecutor {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, reporter: ProgressReporter) -> Result<(), JobQueueError> {
        match &self.behaviour {
            Behaviour::Ok => Ok(()),
            Behaviour::Fail(message) => Err(JobQueueError::failed(message.clone())),
            Behaviour::Panic(message) => panic!("{message}"),
            Behaviour::Interruptible => {
                reporter.cancelled().await;
                Err(JobQueueError::Interrupted)
            }
            Behaviour::Sleep(duration) => {
                tokio::select! {
                    _ = reporter.cancelled() => Err(JobQueueError::Interrupted),
                    _ = tokio::time::sleep(*duration) => {
                        reporter.set_progress(100).await?;
                        Ok(())
                    }
                }
            }
        }
    }
}
