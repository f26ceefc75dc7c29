//! In-process queue backend.
//!
//! Units live in a map keyed by job id. A single dispatcher task hands due
//! units to worker tasks, bounded by a semaphore. Units do not survive a
//! restart: the engine fails instances left running and queues pending ones
//! again on activation, so one process must own the database.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::QueueBackend;
use crate::error::JobQueueError;
use crate::executor::{JobDefinition, JobExecutor};
use crate::handle::{InstanceResolver, JobHandle};
use crate::runner::execute_unit;
use crate::types::JobInstance;

/// Tuning knobs for [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// Maximum number of units executing at once.
    pub concurrency: usize,
    /// How many times a unit's instance is looked up before giving up.
    pub resolve_attempts: u32,
    /// Delay between lookups; the enqueuing transaction may not be committed
    /// yet when the unit is first dispatched.
    pub resolve_backoff: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            resolve_attempts: 5,
            resolve_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Queued,
    Running,
}

#[derive(Debug)]
struct Unit {
    instance_id: Uuid,
    job_name: String,
    due_at: Option<DateTime<Utc>>,
    state: UnitState,
    token: CancellationToken,
}

/// Units plus their arrival order (oldest first).
#[derive(Debug, Default)]
struct MemoryQueueState {
    order: VecDeque<Uuid>,
    units: HashMap<Uuid, Unit>,
}

enum Next {
    Ready {
        job_id: Uuid,
        instance_id: Uuid,
        job_name: String,
        token: CancellationToken,
    },
    Wait(Option<Duration>),
}

impl MemoryQueueState {
    fn insert(&mut self, job_id: Uuid, unit: Unit) {
        self.units.insert(job_id, unit);
        self.order.push_back(job_id);
    }

    fn remove(&mut self, job_id: &Uuid) -> Option<Unit> {
        self.order.retain(|id| id != job_id);
        self.units.remove(job_id)
    }

    /// Mark the oldest due unit as running, or report how long until the
    /// earliest delayed unit becomes due.
    fn next(&mut self, now: DateTime<Utc>) -> Next {
        let mut earliest: Option<DateTime<Utc>> = None;
        for job_id in &self.order {
            let Some(unit) = self.units.get_mut(job_id) else {
                continue;
            };
            if unit.state != UnitState::Queued {
                continue;
            }
            match unit.due_at {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => {
                    unit.state = UnitState::Running;
                    return Next::Ready {
                        job_id: *job_id,
                        instance_id: unit.instance_id,
                        job_name: unit.job_name.clone(),
                        token: unit.token.clone(),
                    };
                }
            }
        }
        Next::Wait(earliest.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)))
    }
}

struct Activation {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    resolver: Arc<dyn InstanceResolver>,
}

struct Inner {
    config: MemoryQueueConfig,
    state: Mutex<MemoryQueueState>,
    activation: OnceLock<Activation>,
    wake: Notify,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queue backend that keeps every unit in process memory.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("config", &self.inner.config)
            .field("listening", &self.inner.activation.get().is_some())
            .field("units", &self.inner.lock().units.len())
            .finish()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_config(MemoryQueueConfig::default())
    }

    pub fn with_config(config: MemoryQueueConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(MemoryQueueState::default()),
                activation: OnceLock::new(),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                permits: Arc::new(Semaphore::new(concurrency)),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Number of units that are queued or running.
    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn activation(&self) -> Result<&Activation, JobQueueError> {
        self.inner.activation.get().ok_or(JobQueueError::NotListening)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn listen(
        &self,
        definitions: Vec<JobDefinition>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Result<(), JobQueueError> {
        let executors = definitions
            .into_iter()
            .map(|d| (d.name, d.executor))
            .collect::<HashMap<_, _>>();
        let count = executors.len();
        self.inner
            .activation
            .set(Activation {
                executors,
                resolver,
            })
            .map_err(|_| JobQueueError::AlreadyListening)?;

        let handle = tokio::spawn(dispatch(Arc::clone(&self.inner)));
        *self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            job_types = count,
            concurrency = self.inner.config.concurrency,
            "memory queue listening"
        );
        Ok(())
    }

    async fn add(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        let activation = self.activation()?;
        if !activation.executors.contains_key(&instance.job_name) {
            return Err(JobQueueError::UnknownJobType(instance.job_name.clone()));
        }
        {
            let mut state = self.inner.lock();
            if state.units.contains_key(&instance.job_id) {
                return Err(JobQueueError::AlreadyQueued(instance.job_id));
            }
            state.insert(
                instance.job_id,
                Unit {
                    instance_id: instance.id,
                    job_name: instance.job_name.clone(),
                    due_at: instance.scheduled_at,
                    state: UnitState::Queued,
                    token: self.inner.shutdown.child_token(),
                },
            );
        }
        debug!(job_id = %instance.job_id, job_name = %instance.job_name, "unit queued");
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn remove(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.activation()?;
        let mut state = self.inner.lock();
        let current = state.units.get(&instance.job_id).map(|u| u.state);
        match current {
            None => Err(JobQueueError::NotFound(instance.job_id)),
            Some(UnitState::Running) => Err(JobQueueError::AlreadyStarted(instance.job_id)),
            Some(UnitState::Queued) => {
                state.remove(&instance.job_id);
                drop(state);
                debug!(job_id = %instance.job_id, "unit removed");
                // The dispatcher may be sleeping until this unit was due.
                self.inner.wake.notify_one();
                Ok(())
            }
        }
    }

    async fn kill(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.activation()?;
        let state = self.inner.lock();
        match state.units.get(&instance.job_id) {
            Some(unit) if unit.state == UnitState::Running => {
                unit.token.cancel();
                debug!(job_id = %instance.job_id, "kill requested");
                Ok(())
            }
            _ => Err(JobQueueError::NotRunning(instance.job_id)),
        }
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        // Wait for in-flight workers to record their final status.
        let all = u32::try_from(self.inner.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(
            Duration::from_secs(5),
            self.inner.permits.acquire_many(all),
        )
        .await;
        if drained.is_err() {
            warn!("memory queue shutdown timed out waiting for running units");
        }
        info!("memory queue stopped");
    }

    fn is_durable(&self) -> bool {
        false
    }
}

async fn dispatch(inner: Arc<Inner>) {
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        loop {
            let next = inner.lock().next(Utc::now());
            match next {
                Next::Ready {
                    job_id,
                    instance_id,
                    job_name,
                    token,
                } => {
                    tokio::spawn(run_unit(
                        Arc::clone(&inner),
                        job_id,
                        instance_id,
                        job_name,
                        token,
                        permit,
                    ));
                    break;
                }
                Next::Wait(delay) => {
                    let sleep = async {
                        match delay {
                            Some(d) => tokio::time::sleep(d).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = inner.wake.notified() => {}
                        _ = sleep => {}
                    }
                }
            }
        }
    }
}

async fn run_unit(
    inner: Arc<Inner>,
    job_id: Uuid,
    instance_id: Uuid,
    job_name: String,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    if let Some(activation) = inner.activation.get() {
        match activation.executors.get(&job_name) {
            Some(executor) => match resolve(&inner, activation, job_id, instance_id).await {
                Ok(handle) if handle.instance().id == instance_id => {
                    if let Err(e) = execute_unit(handle, Arc::clone(executor), token).await {
                        error!(%job_id, %job_name, error = %e, "unit execution failed");
                    }
                }
                Ok(handle) => warn!(
                    %job_id,
                    %job_name,
                    expected = %instance_id,
                    found = %handle.instance().id,
                    "current instance changed before dispatch; dropping unit"
                ),
                Err(e) => {
                    error!(%job_id, %job_name, error = %e, "failed to find job (job name modified?)")
                }
            },
            None => error!(%job_id, %job_name, "no executor for queued unit"),
        }
    }
    inner.lock().remove(&job_id);
    drop(permit);
}

/// Look up the unit's instance, retrying while the enqueuing transaction may
/// still be uncommitted: the job is missing or still points at the previous
/// instance.
async fn resolve(
    inner: &Inner,
    activation: &Activation,
    job_id: Uuid,
    instance_id: Uuid,
) -> Result<Arc<dyn JobHandle>, JobQueueError> {
    let attempts = inner.config.resolve_attempts.max(1);
    let mut attempt = 1;
    loop {
        let resolved = activation.resolver.resolve(job_id).await;
        let retry = match &resolved {
            Ok(handle) => handle.instance().id != instance_id,
            Err(JobQueueError::NotFound(_)) => true,
            Err(_) => false,
        };
        if !retry || attempt >= attempts {
            return resolved;
        }
        attempt += 1;
        tokio::time::sleep(inner.config.resolve_backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryResolver, StaticExecutor};
    use crate::types::JobStatus;

    async fn wait_for(
        resolver: &MemoryResolver,
        job_id: Uuid,
        status: JobStatus,
    ) -> JobInstance {
        for _ in 0..200 {
            if let Some(h) = resolver.get(job_id) {
                let snap = h.snapshot();
                if snap.status == status {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    async fn listening(executors: Vec<StaticExecutor>) -> (MemoryQueue, Arc<MemoryResolver>) {
        let queue = MemoryQueue::new();
        let resolver = Arc::new(MemoryResolver::new());
        let defs = executors
            .into_iter()
            .map(|e| JobDefinition::new(Arc::new(e)))
            .collect();
        queue.listen(defs, resolver.clone()).await.unwrap();
        (queue, resolver)
    }

    #[tokio::test]
    async fn add_before_listen_fails() {
        let queue = MemoryQueue::new();
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}");
        assert!(matches!(
            queue.add(&inst).await,
            Err(JobQueueError::NotListening)
        ));
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let (queue, resolver) = listening(vec![StaticExecutor::ok()]).await;
        let err = queue.listen(Vec::new(), resolver).await.unwrap_err();
        assert!(matches!(err, JobQueueError::AlreadyListening));
    }

    #[tokio::test]
    async fn runs_unit_to_done() {
        let (queue, resolver) = listening(vec![StaticExecutor::ok()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}");
        resolver.insert(inst.clone());
        queue.add(&inst).await.unwrap();
        wait_for(&resolver, inst.job_id, JobStatus::Done).await;
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        let (queue, _resolver) = listening(vec![StaticExecutor::ok()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "nope", "{}");
        assert!(matches!(
            queue.add(&inst).await,
            Err(JobQueueError::UnknownJobType(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn duplicate_unit_rejected() {
        let (queue, resolver) = listening(vec![StaticExecutor::ok()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}")
            .scheduled_for(Utc::now() + chrono::Duration::hours(1));
        resolver.insert(inst.clone());
        queue.add(&inst).await.unwrap();
        assert!(matches!(
            queue.add(&inst).await,
            Err(JobQueueError::AlreadyQueued(_))
        ));
    }

    #[tokio::test]
    async fn remove_pending_unit() {
        let (queue, resolver) = listening(vec![StaticExecutor::ok()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}")
            .scheduled_for(Utc::now() + chrono::Duration::hours(1));
        resolver.insert(inst.clone());
        queue.add(&inst).await.unwrap();
        queue.remove(&inst).await.unwrap();
        assert!(queue.is_empty());
        assert!(matches!(
            queue.remove(&inst).await,
            Err(JobQueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delayed_unit_runs_when_due() {
        let (queue, resolver) = listening(vec![StaticExecutor::ok()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}")
            .scheduled_for(Utc::now() + chrono::Duration::milliseconds(150));
        resolver.insert(inst.clone());
        queue.add(&inst).await.unwrap();
        assert_eq!(
            resolver.get(inst.job_id).unwrap().snapshot().status,
            JobStatus::Scheduled
        );
        let done = wait_for(&resolver, inst.job_id, JobStatus::Done).await;
        assert!(done.started_at.unwrap() >= inst.scheduled_at.unwrap());
    }

    #[tokio::test]
    async fn kill_running_unit() {
        let (queue, resolver) = listening(vec![StaticExecutor::interruptible()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}");
        resolver.insert(inst.clone());

        assert!(matches!(
            queue.kill(&inst).await,
            Err(JobQueueError::NotRunning(_))
        ));
        queue.add(&inst).await.unwrap();
        wait_for(&resolver, inst.job_id, JobStatus::Running).await;
        assert!(matches!(
            queue.remove(&inst).await,
            Err(JobQueueError::AlreadyStarted(_))
        ));
        queue.kill(&inst).await.unwrap();
        let killed = wait_for(&resolver, inst.job_id, JobStatus::Killed).await;
        assert!(killed.log.contains("job killed"));
    }

    #[tokio::test]
    async fn shutdown_interrupts_running_units() {
        let (queue, resolver) = listening(vec![StaticExecutor::interruptible()]).await;
        let inst = JobInstance::new(Uuid::new_v4(), "test", "{}");
        resolver.insert(inst.clone());
        queue.add(&inst).await.unwrap();
        wait_for(&resolver, inst.job_id, JobStatus::Running).await;
        queue.shutdown().await;
        assert_eq!(
            resolver.get(inst.job_id).unwrap().snapshot().status,
            JobStatus::Killed
        );
    }
}
