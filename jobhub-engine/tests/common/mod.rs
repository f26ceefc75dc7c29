use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobhub_engine::{
    EngineConfig, JobArgs, JobContext, JobEngine, JobInstance, JobProgress, JobQueueError,
    JobStatus, JobStore, JobType, MemoryQueue, QueueBackend, RawArgs, SqlQueue, SqlQueueConfig,
};
use jobhub_db::{create_pool, DbConnectionConfig};
use jobhub_queue::{InstanceResolver, JobDefinition};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sql,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
}

impl JobArgs for Email {}

#[derive(Debug, Serialize, Deserialize)]
pub struct Count {
    pub steps: i64,
}

impl JobArgs for Count {}

#[derive(Debug, Serialize, Deserialize)]
pub struct Sleepy {
    pub label: String,
}

impl JobArgs for Sleepy {}

pub struct Harness {
    pub engine: Arc<JobEngine>,
    /// Each permit lets one `SendEmail` run past its halfway point.
    pub gate: Arc<Semaphore>,
    _dir: TempDir,
}

pub async fn test_store() -> (JobStore, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let pool = create_pool(&DbConnectionConfig::new(url))
        .await
        .expect("pool");
    jobhub_migrations::sqlite_migrator()
        .run(&pool)
        .await
        .expect("migrations");
    (JobStore::new(pool), dir)
}

fn queue(backend: Backend, store: &JobStore) -> Arc<dyn QueueBackend> {
    match backend {
        Backend::Memory => Arc::new(MemoryQueue::new()),
        Backend::Sql => Arc::new(SqlQueue::new(
            store.clone(),
            SqlQueueConfig {
                worker_id: "engine-test".into(),
                concurrency: 2,
                poll_interval: Duration::from_millis(20),
                lease: Duration::from_secs(5),
                heartbeat: Duration::from_millis(50),
                reap_interval: Duration::from_millis(200),
            },
        )),
    }
}

pub fn send_email(gate: Arc<Semaphore>) -> JobType {
    JobType::builder("SendEmail")
        .description("Send an email")
        .resource("mail")
        .parser(|raw: &RawArgs| {
            let to = raw.required_email("to");
            let subject = raw.optional_str("subject").unwrap_or_default();
            raw.finish(to.map(|to| Email { to, subject }))
        })
        .handler(move |ctx: JobContext<Email>| {
            let gate = Arc::clone(&gate);
            async move {
                ctx.set_progress(50).await?;
                ctx.append_log("sent half").await?;
                tokio::select! {
                    Ok(permit) = gate.acquire() => permit.forget(),
                    _ = ctx.cancelled() => return Err(JobQueueError::Interrupted),
                }
                Ok(())
            }
        })
        .build()
        .expect("SendEmail")
}

pub fn count() -> JobType {
    JobType::builder("count")
        .description("Count to a number")
        .parser(|raw: &RawArgs| {
            let steps = raw.required_i64("steps");
            raw.finish(steps.map(|steps| Count { steps }))
        })
        .handler(|ctx: JobContext<Count>| async move {
            ctx.append_log(format!("steps={}", ctx.args.steps)).await?;
            ctx.set_progress(100).await
        })
        .build()
        .expect("count")
}

pub fn sleepy() -> JobType {
    JobType::builder("sleepy")
        .description("Wait until interrupted")
        .serde_args::<Sleepy>()
        .handler(|ctx: JobContext<Sleepy>| async move {
            ctx.append_log(format!("waiting as {}", ctx.args.label)).await?;
            ctx.cancelled().await;
            Err(JobQueueError::Interrupted)
        })
        .build()
        .expect("sleepy")
}

pub fn broken() -> JobType {
    JobType::builder("broken")
        .description("Always fails")
        .serde_args::<Sleepy>()
        .handler(|_ctx: JobContext<Sleepy>| async move {
            Err(JobQueueError::failed("disk full"))
        })
        .build()
        .expect("broken")
}

/// Memory backend whose `add` can be switched to fail.
#[derive(Default)]
pub struct FlakyQueue {
    inner: MemoryQueue,
    fail_adds: AtomicBool,
}

impl FlakyQueue {
    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    async fn listen(
        &self,
        definitions: Vec<JobDefinition>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Result<(), JobQueueError> {
        self.inner.listen(definitions, resolver).await
    }

    async fn add(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(JobQueueError::Unavailable);
        }
        self.inner.add(instance).await
    }

    async fn remove(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.inner.remove(instance).await
    }

    async fn kill(&self, instance: &JobInstance) -> Result<(), JobQueueError> {
        self.inner.kill(instance).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }
}

fn assemble(store: JobStore, queue: Arc<dyn QueueBackend>, dir: TempDir) -> Harness {
    let engine = JobEngine::new(store, queue).with_config(EngineConfig {
        kill_grace: Duration::from_secs(5),
        kill_poll: Duration::from_millis(20),
    });
    let gate = Arc::new(Semaphore::new(0));
    engine.register(send_email(Arc::clone(&gate))).unwrap();
    engine.register(count()).unwrap();
    engine.register(sleepy()).unwrap();
    engine.register(broken()).unwrap();
    Harness {
        engine: Arc::new(engine),
        gate,
        _dir: dir,
    }
}

/// An engine with every test job type registered but not yet activated.
pub async fn idle_harness(backend: Backend) -> Harness {
    let (store, dir) = test_store().await;
    let queue = queue(backend, &store);
    assemble(store, queue, dir)
}

pub async fn harness(backend: Backend) -> Harness {
    let harness = idle_harness(backend).await;
    harness.engine.activate().await.unwrap();
    harness
}

/// An activated engine on a store that already holds rows.
pub async fn harness_on(backend: Backend, store: JobStore, dir: TempDir) -> Harness {
    let queue = queue(backend, &store);
    let harness = assemble(store, queue, dir);
    harness.engine.activate().await.unwrap();
    harness
}

pub async fn flaky_harness() -> (Harness, Arc<FlakyQueue>) {
    let (store, dir) = test_store().await;
    let flaky = Arc::new(FlakyQueue::default());
    let harness = assemble(store, Arc::clone(&flaky) as Arc<dyn QueueBackend>, dir);
    harness.engine.activate().await.unwrap();
    (harness, flaky)
}

pub fn args(value: serde_json::Value) -> RawArgs {
    RawArgs::from_json(value).unwrap()
}

pub async fn wait_until(
    engine: &JobEngine,
    job_id: Uuid,
    what: &str,
    predicate: impl Fn(&JobProgress) -> bool,
) -> JobProgress {
    let mut last = None;
    for _ in 0..500 {
        let progress = engine.query_progress(job_id).await.unwrap();
        if predicate(&progress) {
            return progress;
        }
        last = Some(progress);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {what}; last seen {last:?}");
}

pub async fn wait_for_status(engine: &JobEngine, job_id: Uuid, status: JobStatus) -> JobProgress {
    wait_until(engine, job_id, status.as_str(), |p| p.status == status).await
}
