//! The job engine: orchestrates the registry, the record store and the queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobhub_db::{JobFilter, JobRecord, JobStore, StoreResolver, WORKER_LOST_LOG_LINE};
use jobhub_queue::{
    InstanceResolver, JobDefinition, JobHandle, JobInstance, JobProgress, JobQueueError,
    JobStatus, QueueBackend,
};

use crate::args::RawArgs;
use crate::codec::{ArgsCodec, JsonCodec};
use crate::error::EngineError;
use crate::registry::{ErasedJobType, JobRegistry, JobType, JobTypeInfo};

const PENDING: [JobStatus; 2] = [JobStatus::New, JobStatus::Scheduled];

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long `update` waits for a killed instance to stop, and how long an
    /// enqueue waits for the backend to release the previous unit.
    pub kill_grace: Duration,
    /// Poll period while waiting on either of the above.
    pub kill_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(10),
            kill_poll: Duration::from_millis(50),
        }
    }
}

/// What an abort did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AbortOutcome {
    /// The unit never started and is now `Cancelled`.
    Cancelled,
    /// The unit is running; the backend reports the final status later.
    KillRequested,
}

/// A job with its current instance and what the registry knows about its type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    pub job: JobRecord,
    pub instance: Option<JobInstance>,
    /// `None` when the job type was removed from code after submission.
    pub job_type: Option<JobTypeInfo>,
}

impl JobDetail {
    #[inline]
    pub fn type_registered(&self) -> bool {
        self.job_type.is_some()
    }
}

/// Resolves units to handles, refusing jobs whose type is gone.
struct EngineResolver {
    store: JobStore,
    registry: Arc<JobRegistry>,
    instances: StoreResolver,
}

#[async_trait]
impl InstanceResolver for EngineResolver {
    async fn resolve(&self, job_id: Uuid) -> Result<Arc<dyn JobHandle>, JobQueueError> {
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(JobQueueError::NotFound(job_id))?;
        if self.registry.lookup(&job.job_name).is_none() {
            return Err(JobQueueError::UnknownJobType(job.job_name));
        }
        self.instances.resolve(job_id).await
    }
}

/// Serializes engine operations on one job id within this process.
struct JobLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    job_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.job_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Submits, aborts, reruns and updates jobs and answers progress queries.
///
/// Job types are registered first, then [`activate`](Self::activate) freezes
/// the registry and starts the queue backend. Mutating operations fail with
/// [`EngineError::NotActivated`] before that.
pub struct JobEngine {
    store: JobStore,
    queue: Arc<dyn QueueBackend>,
    codec: Arc<dyn ArgsCodec>,
    registry: Arc<JobRegistry>,
    config: EngineConfig,
    activated: AtomicBool,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEngine")
            .field("registry", &self.registry)
            .field("codec", &self.codec)
            .field("config", &self.config)
            .field("activated", &self.is_activated())
            .finish_non_exhaustive()
    }
}

impl JobEngine {
    pub fn new(store: JobStore, queue: Arc<dyn QueueBackend>) -> Self {
        Self {
            store,
            queue,
            codec: Arc::new(JsonCodec),
            registry: Arc::new(JobRegistry::new()),
            config: EngineConfig::default(),
            activated: AtomicBool::new(false),
            locks: DashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: impl ArgsCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    #[inline]
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn register(&self, job_type: JobType) -> Result<(), EngineError> {
        let name = job_type.name().to_owned();
        self.registry.register(job_type)?;
        debug!(job_name = %name, "job type registered");
        Ok(())
    }

    /// Freeze the registry and start the queue backend. Call exactly once,
    /// after every job type is registered.
    pub async fn activate(&self) -> Result<(), EngineError> {
        if self
            .activated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyActivated);
        }

        let types = self.registry.freeze();
        let definitions: Vec<JobDefinition> = types
            .iter()
            .map(|t| JobDefinition::new(t.executor(Arc::clone(&self.codec))))
            .collect();
        let resolver = Arc::new(EngineResolver {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            instances: StoreResolver::new(self.store.clone()),
        });

        if let Err(e) = self.queue.listen(definitions, resolver).await {
            self.activated.store(false, Ordering::Release);
            return Err(e.into());
        }
        if !self.queue.is_durable() {
            self.recover_orphans().await?;
        }
        info!(job_types = types.len(), "job engine activated");
        Ok(())
    }

    /// Reconcile rows a previous process left behind when the backend keeps
    /// units only in memory. Running instances fail and pending instances of
    /// registered types are queued again.
    async fn recover_orphans(&self) -> Result<(), EngineError> {
        let failed = self.store.fail_running(WORKER_LOST_LOG_LINE).await?;
        let mut requeued = 0;
        for instance in self.store.pending_instances().await? {
            if self.registry.lookup(&instance.job_name).is_none() {
                debug!(job_id = %instance.job_id, job_name = %instance.job_name, "leaving orphaned job type pending");
                continue;
            }
            match self.queue.add(&instance).await {
                Ok(()) => requeued += 1,
                // Submitted concurrently with activation.
                Err(JobQueueError::AlreadyQueued(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if failed > 0 || requeued > 0 {
            info!(failed, requeued, "recovered jobs left by a previous process");
        }
        Ok(())
    }

    /// Stop the queue backend. In-flight units are interrupted.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Submit a job for immediate execution. Returns the job id.
    pub async fn submit(&self, job_name: &str, raw: RawArgs) -> Result<Uuid, EngineError> {
        self.submit_inner(job_name, raw, None).await
    }

    /// Submit a job that becomes eligible at `at`. A future time yields a
    /// `Scheduled` instance.
    pub async fn submit_at(
        &self,
        job_name: &str,
        raw: RawArgs,
        at: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        self.submit_inner(job_name, raw, Some(at)).await
    }

    async fn submit_inner(
        &self,
        job_name: &str,
        raw: RawArgs,
        at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, EngineError> {
        self.ensure_activated()?;
        let job_type = self
            .registry
            .lookup(job_name)
            .ok_or_else(|| EngineError::UnknownJobType(job_name.to_owned()))?;
        let args = self.encode_args(job_type.as_ref(), raw)?;

        let mut instance = JobInstance::new(Uuid::new_v4(), job_name, args);
        if let Some(at) = at {
            instance = instance.scheduled_for(at);
        }
        let job = JobRecord::for_instance(&instance);
        self.enqueue(Some(&job), &instance).await?;

        info!(
            job_id = %instance.job_id,
            job_name = %instance.job_name,
            status = %instance.status,
            "job submitted"
        );
        Ok(instance.job_id)
    }

    /// Abort the current instance of a job.
    ///
    /// A pending unit is removed and cancelled right away. A running unit is
    /// asked to stop; its final status arrives through the queue later.
    pub async fn abort(&self, job_id: Uuid) -> Result<AbortOutcome, EngineError> {
        self.ensure_activated()?;
        let _lock = self.lock(job_id).await;
        let current = self.current_instance(job_id).await?;
        self.abort_instance(&current).await
    }

    /// Run a finished job again with the same arguments.
    pub async fn rerun(&self, job_id: Uuid) -> Result<JobInstance, EngineError> {
        self.ensure_activated()?;
        let _lock = self.lock(job_id).await;
        let current = self.current_instance(job_id).await?;
        if current.status != JobStatus::Done {
            return Err(EngineError::IllegalTransition {
                job_id,
                status: current.status,
                operation: "rerun",
            });
        }
        self.registered_type(&current)?;

        let instance = JobInstance::new(job_id, current.job_name.clone(), current.args.clone());
        self.enqueue(None, &instance).await?;
        info!(%job_id, job_name = %instance.job_name, instance_id = %instance.id, "job rerun");
        Ok(instance)
    }

    /// Replace the arguments of an active job.
    ///
    /// The current instance is aborted first; if that fails the update does
    /// nothing. A running instance gets `kill_grace` to stop before the update
    /// gives up. A pending schedule in the future is kept.
    pub async fn update(&self, job_id: Uuid, raw: RawArgs) -> Result<JobInstance, EngineError> {
        self.ensure_activated()?;
        let _lock = self.lock(job_id).await;
        let current = self.current_instance(job_id).await?;
        let job_type = self.registered_type(&current)?;
        let args = self.encode_args(job_type.as_ref(), raw)?;

        let outcome = self.abort_instance(&current).await.map_err(|e| match e {
            EngineError::IllegalTransition { job_id, status, .. } => {
                EngineError::IllegalTransition {
                    job_id,
                    status,
                    operation: "update",
                }
            }
            other => other,
        })?;
        if outcome == AbortOutcome::KillRequested {
            self.await_terminal(&current).await?;
        }

        let mut instance = JobInstance::new(job_id, current.job_name.clone(), args);
        if let Some(at) = current.scheduled_at.filter(|at| *at > Utc::now()) {
            instance = instance.scheduled_for(at);
        }
        self.enqueue(None, &instance).await?;
        info!(%job_id, job_name = %instance.job_name, instance_id = %instance.id, "job updated");
        Ok(instance)
    }

    /// Progress of the current instance. Read-only and cheap enough to poll.
    pub async fn query_progress(&self, job_id: Uuid) -> Result<JobProgress, EngineError> {
        self.store
            .progress(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    pub async fn job(&self, job_id: Uuid) -> Result<JobDetail, EngineError> {
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        let instance = self.store.current_instance(job_id).await?;
        let job_type = self
            .registry
            .lookup(&job.job_name)
            .map(|t| t.info().clone());
        Ok(JobDetail {
            job,
            instance,
            job_type,
        })
    }

    /// Every instance of a job, oldest first.
    pub async fn history(&self, job_id: Uuid) -> Result<Vec<JobInstance>, EngineError> {
        let instances = self.store.list_instances(job_id).await?;
        if instances.is_empty() {
            return Err(EngineError::JobNotFound(job_id));
        }
        Ok(instances)
    }

    /// A page of jobs plus the total matching the status filter.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<JobRecord>, i64), EngineError> {
        let jobs = self.store.list_jobs(filter).await?;
        let total = self.store.count_jobs(filter.status).await?;
        Ok((jobs, total))
    }

    pub fn job_types(&self) -> Vec<JobTypeInfo> {
        self.registry.infos()
    }

    fn ensure_activated(&self) -> Result<(), EngineError> {
        if self.is_activated() {
            Ok(())
        } else {
            Err(EngineError::NotActivated)
        }
    }

    async fn lock(&self, job_id: Uuid) -> JobLock<'_> {
        let mutex = Arc::clone(&self.locks.entry(job_id).or_default());
        let guard = mutex.lock_owned().await;
        JobLock {
            locks: &self.locks,
            job_id,
            guard: Some(guard),
        }
    }

    async fn current_instance(&self, job_id: Uuid) -> Result<JobInstance, EngineError> {
        self.store
            .current_instance(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    fn registered_type(&self, instance: &JobInstance) -> Result<Arc<dyn ErasedJobType>, EngineError> {
        self.registry
            .lookup(&instance.job_name)
            .ok_or_else(|| EngineError::JobTypeNotRegistered {
                job_id: instance.job_id,
                job_type: instance.job_name.clone(),
            })
    }

    fn encode_args(&self, job_type: &dyn ErasedJobType, raw: RawArgs) -> Result<String, EngineError> {
        let value = job_type.parse(&raw)?;
        Ok(self.codec.encode(&value)?)
    }

    /// Persist the instance (and the job row for a new job) and hand it to the
    /// queue in one transaction. A failed enqueue rolls the rows back.
    async fn enqueue(&self, job: Option<&JobRecord>, instance: &JobInstance) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        if let Some(job) = job {
            JobStore::insert_job(&mut tx, job).await?;
        }
        JobStore::insert_instance(&mut tx, instance).await?;
        self.add_unit(instance).await?;

        if let Err(e) = tx.commit().await {
            warn!(job_id = %instance.job_id, error = %e, "commit failed after enqueue; removing unit");
            if let Err(remove_err) = self.queue.remove(instance).await {
                warn!(job_id = %instance.job_id, error = %remove_err, "failed to remove orphaned unit");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// `add`, tolerating a backend that has not yet released the previous
    /// unit of the same job.
    async fn add_unit(&self, instance: &JobInstance) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.kill_grace;
        loop {
            match self.queue.add(instance).await {
                Err(JobQueueError::AlreadyQueued(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(self.config.kill_poll).await;
                }
                other => return Ok(other?),
            }
        }
    }

    async fn abort_instance(&self, instance: &JobInstance) -> Result<AbortOutcome, EngineError> {
        match instance.status {
            JobStatus::Running => self.kill(instance).await,
            JobStatus::New | JobStatus::Scheduled => match self.queue.remove(instance).await {
                // No unit means nothing can pick the instance up any more.
                Ok(()) | Err(JobQueueError::NotFound(_)) => self.cancel_pending(instance).await,
                Err(JobQueueError::AlreadyStarted(_)) => self.kill(instance).await,
                Err(e) => Err(e.into()),
            },
            status => Err(EngineError::IllegalTransition {
                job_id: instance.job_id,
                status,
                operation: "abort",
            }),
        }
    }

    async fn kill(&self, instance: &JobInstance) -> Result<AbortOutcome, EngineError> {
        match self.queue.kill(instance).await {
            Ok(()) => {
                info!(job_id = %instance.job_id, instance_id = %instance.id, "kill requested");
                Ok(AbortOutcome::KillRequested)
            }
            Err(JobQueueError::NotRunning(_)) => {
                let status = self.store.instance_status(instance.id).await?;
                if status.is_pending() {
                    return self.cancel_pending(instance).await;
                }
                if status.is_terminal() {
                    return Err(EngineError::IllegalTransition {
                        job_id: instance.job_id,
                        status,
                        operation: "abort",
                    });
                }
                Err(JobQueueError::NotRunning(instance.job_id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_pending(&self, instance: &JobInstance) -> Result<AbortOutcome, EngineError> {
        let changed = self
            .store
            .transition(instance.id, &PENDING, JobStatus::Cancelled, None)
            .await?;
        // The durable backend cancels the row itself when removing the unit.
        let status = if changed {
            JobStatus::Cancelled
        } else {
            self.store.instance_status(instance.id).await?
        };
        if status != JobStatus::Cancelled {
            return Err(EngineError::IllegalTransition {
                job_id: instance.job_id,
                status,
                operation: "abort",
            });
        }
        info!(job_id = %instance.job_id, instance_id = %instance.id, "job cancelled");
        Ok(AbortOutcome::Cancelled)
    }

    async fn await_terminal(&self, instance: &JobInstance) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.kill_grace;
        loop {
            let status = self.store.instance_status(instance.id).await?;
            if status.is_terminal() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(job_id = %instance.job_id, %status, "instance did not stop within the kill grace period");
                return Err(EngineError::IllegalTransition {
                    job_id: instance.job_id,
                    status,
                    operation: "update",
                });
            }
            tokio::time::sleep(self.config.kill_poll).await;
        }
    }
}
