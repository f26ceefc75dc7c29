//! Durable queue backend on top of the `job_instances` table.
//!
//! The instance row is the unit. A poller claims due rows of registered job
//! types by writing a lease, a heartbeat keeps the lease alive while the unit
//! runs and picks up persisted kill requests, and a reaper recovers units
//! whose worker disappeared.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobhub_queue::{
    execute_unit, InstanceResolver, JobDefinition, JobExecutor, JobInstance, JobQueueError,
    JobStatus, QueueBackend, PROGRESS_REFRESH_INTERVAL,
};

use crate::store::JobStore;

const RESOLVE_FAILED_LOG_LINE: &str = "failed to find job (job name modified?)";
const MIN_TICK: Duration = Duration::from_millis(10);

/// Tuning knobs for [`SqlQueue`].
#[derive(Debug, Clone)]
pub struct SqlQueueConfig {
    /// Identifies this process in `lease_owner`.
    pub worker_id: String,
    pub concurrency: usize,
    /// Fallback poll period when nothing wakes the poller.
    pub poll_interval: Duration,
    pub lease: Duration,
    /// Also bounds how long a kill requested by another process takes to
    /// reach the unit.
    pub heartbeat: Duration,
    pub reap_interval: Duration,
}

impl Default for SqlQueueConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            heartbeat: PROGRESS_REFRESH_INTERVAL,
            reap_interval: Duration::from_secs(15),
        }
    }
}

struct Activation {
    names: Vec<String>,
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    resolver: Arc<dyn InstanceResolver>,
}

struct Inner {
    store: JobStore,
    config: SqlQueueConfig,
    activation: OnceLock<Activation>,
    /// Units executing in this process, keyed by instance id.
    running: DashMap<Uuid, CancellationToken>,
    wake: Notify,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lease_until(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Utc::now() + lease
    }
}

/// Queue backend that persists every unit in SQLite.
#[derive(Clone)]
pub struct SqlQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for SqlQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlQueue")
            .field("config", &self.inner.config)
            .field("listening", &self.inner.activation.get().is_some())
            .field("running", &self.inner.running.len())
            .finish()
    }
}

impl SqlQueue {
    pub fn new(store: JobStore, config: SqlQueueConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                activation: OnceLock::new(),
                running: DashMap::new(),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                permits: Arc::new(Semaphore::new(concurrency)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    fn activation(&self) -> Result<&Activation, JobQueueError> {
        self.inner.activation.get().ok_or(JobQueueError::NotListening)
    }
}

#[async_trait]
impl QueueBackend for SqlQueue {
    async fn listen(
        &self,
        definitions: Vec<JobDefinition>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Result<(), JobQueueError> {
        let names = definitions.iter().map(|d| d.name.clone()).collect();
        let executors = definitions
            .into_iter()
            .map(|d| (d.name, d.executor))
            .collect::<HashMap<_, _>>();
        let count = executors.len();
        self.inner
            .activation
            .set(Activation {
                names,
                executors,
                resolver,
            })
            .map_err(|_| JobQueueError::AlreadyListening)?;

        // Recover whatever a previous process left behind before polling.
        self.inner.store.reap_expired(Utc::now()).await?;

        let poller = tokio::spawn(poll(Arc::clone(&self.inner)));
        let reaper = tokio::spawn(reap(Arc::clone(&self.inner)));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([poller, reaper]);
        info!(
            worker_id = %self.inner.config.worker_id,
            job_types = count,
            concurrency = self.inner.config.concurrency,
            "sql queue listening"
        );
        Ok(())
    }

    /// The row itself is written by the caller's transaction, where the
    /// store's unique index already rejects a second active unit for the job.
    /// This only validates the unit and wakes the poller.
    async fn add(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        let activation = self.activation()?;
        if !activation.executors.contains_key(&instance.job_name) {
            return Err(JobQueueError::UnknownJobType(instance.job_name.clone()));
        }
        debug!(job_id = %instance.job_id, job_name = %instance.job_name, "unit queued");
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn remove(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.activation()?;
        if self.inner.store.cancel_unclaimed(instance.id).await? {
            debug!(job_id = %instance.job_id, "unit removed");
            return Ok(());
        }
        match self.inner.store.lease_state(instance.id).await? {
            Some((status, owner)) if status == JobStatus::Running || owner.is_some() => {
                Err(JobQueueError::AlreadyStarted(instance.job_id))
            }
            _ => Err(JobQueueError::NotFound(instance.job_id)),
        }
    }

    async fn kill(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.activation()?;
        if !self.inner.store.request_kill(instance.id).await? {
            return Err(JobQueueError::NotRunning(instance.job_id));
        }
        // Other workers notice the flag on their next heartbeat.
        if let Some(token) = self.inner.running.get(&instance.id) {
            token.cancel();
        }
        debug!(job_id = %instance.job_id, "kill requested");
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
        let all = u32::try_from(self.inner.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(
            Duration::from_secs(5),
            self.inner.permits.acquire_many(all),
        )
        .await;
        if drained.is_err() {
            warn!("sql queue shutdown timed out waiting for running units");
        }
        info!(worker_id = %self.inner.config.worker_id, "sql queue stopped");
    }
}

async fn poll(inner: Arc<Inner>) {
    let Some(activation) = inner.activation.get() else {
        return;
    };
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        loop {
            let claimed = inner
                .store
                .claim_next(
                    &inner.config.worker_id,
                    &activation.names,
                    Utc::now(),
                    inner.lease_until(),
                )
                .await;
            match claimed {
                Ok(Some(instance)) => {
                    tokio::spawn(run_unit(Arc::clone(&inner), instance, permit));
                    break;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim job unit"),
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
        }
    }
}

async fn run_unit(inner: Arc<Inner>, instance: JobInstance, permit: OwnedSemaphorePermit) {
    let token = inner.shutdown.child_token();
    inner.running.insert(instance.id, token.clone());

    let done = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat(
        Arc::clone(&inner),
        instance.id,
        token.clone(),
        done.clone(),
    ));

    if let Some(activation) = inner.activation.get() {
        run_claimed(&inner, activation, &instance, token).await;
    }

    done.cancel();
    let _ = heartbeat.await;
    inner.running.remove(&instance.id);
    drop(permit);
    // A slot is free again.
    inner.wake.notify_one();
}

async fn run_claimed(
    inner: &Inner,
    activation: &Activation,
    instance: &JobInstance,
    token: CancellationToken,
) {
    let job_id = instance.job_id;
    let job_name = &instance.job_name;
    let Some(executor) = activation.executors.get(job_name) else {
        error!(%job_id, %job_name, "no executor for claimed unit");
        return;
    };
    match activation.resolver.resolve(job_id).await {
        Ok(handle) if handle.instance().id == instance.id => {
            if let Err(e) = execute_unit(handle, Arc::clone(executor), token).await {
                error!(%job_id, %job_name, error = %e, "unit execution failed");
            }
        }
        Ok(handle) => warn!(
            %job_id,
            %job_name,
            expected = %instance.id,
            found = %handle.instance().id,
            "current instance changed before dispatch; dropping unit"
        ),
        Err(e) => {
            error!(%job_id, %job_name, error = %e, "{RESOLVE_FAILED_LOG_LINE}");
            let pending = [JobStatus::New, JobStatus::Scheduled];
            if let Err(e) = inner
                .store
                .transition(
                    instance.id,
                    &pending,
                    JobStatus::Exception,
                    Some(RESOLVE_FAILED_LOG_LINE),
                )
                .await
            {
                error!(%job_id, error = %e, "failed to record unresolvable unit");
            }
        }
    }
}

async fn heartbeat(
    inner: Arc<Inner>,
    instance_id: Uuid,
    token: CancellationToken,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat.max(MIN_TICK));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match inner
            .store
            .renew_lease(instance_id, &inner.config.worker_id, inner.lease_until())
            .await
        {
            Ok(Some(true)) => {
                if !token.is_cancelled() {
                    debug!(%instance_id, "persisted kill request observed");
                    token.cancel();
                }
            }
            Ok(Some(false)) => {}
            Ok(None) => {
                if !done.is_cancelled() {
                    warn!(%instance_id, "lease lost; interrupting unit");
                    token.cancel();
                }
                return;
            }
            Err(e) => warn!(%instance_id, error = %e, "failed to renew lease"),
        }
    }
}

async fn reap(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.reap_interval.max(MIN_TICK));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.store.reap_expired(Utc::now()).await {
            error!(error = %e, "failed to reap expired leases");
        }
    }
}
