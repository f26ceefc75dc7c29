mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobhub_db::{JobStore, SqlQueue, SqlQueueConfig, StoreResolver};
use jobhub_queue::testing::StaticExecutor;
use jobhub_queue::{
    JobDefinition, JobQueueError, JobStatus, QueueBackend, KILLED_LOG_LINE,
    PROGRESS_REFRESH_INTERVAL,
};
use uuid::Uuid;

use common::{instance, seed, test_store};

fn fast_config() -> SqlQueueConfig {
    SqlQueueConfig {
        worker_id: "test-worker".into(),
        concurrency: 2,
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_secs(5),
        heartbeat: Duration::from_millis(50),
        reap_interval: Duration::from_millis(100),
    }
}

async fn listening(store: &JobStore, executors: Vec<StaticExecutor>) -> SqlQueue {
    let queue = SqlQueue::new(store.clone(), fast_config());
    let defs = executors
        .into_iter()
        .map(|e| JobDefinition::new(Arc::new(e)))
        .collect();
    queue
        .listen(defs, Arc::new(StoreResolver::new(store.clone())))
        .await
        .unwrap();
    queue
}

async fn wait_for(store: &JobStore, job_id: Uuid, status: JobStatus) -> jobhub_queue::JobInstance {
    for _ in 0..300 {
        let current = store.current_instance(job_id).await.unwrap().unwrap();
        if current.status == status {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status}");
}

#[tokio::test]
async fn runs_committed_unit_to_done() {
    let (store, _dir) = test_store().await;
    let queue = listening(&store, vec![StaticExecutor::ok().named("SendEmail")]).await;

    let inst = instance("SendEmail");
    seed(&store, &inst).await;
    queue.add(&inst).await.unwrap();

    let done = wait_for(&store, inst.job_id, JobStatus::Done).await;
    assert!(done.started_at.is_some());
    assert_eq!(
        store.find_job(inst.job_id).await.unwrap().unwrap().status,
        JobStatus::Done
    );
    queue.shutdown().await;
}

#[tokio::test]
async fn failing_handler_records_exception() {
    let (store, _dir) = test_store().await;
    let queue = listening(
        &store,
        vec![StaticExecutor::fail("mailbox full").named("SendEmail")],
    )
    .await;

    let inst = instance("SendEmail");
    seed(&store, &inst).await;
    queue.add(&inst).await.unwrap();

    let failed = wait_for(&store, inst.job_id, JobStatus::Exception).await;
    assert!(failed.log.contains("mailbox full"));
    queue.shutdown().await;
}

#[tokio::test]
async fn add_validates_activation_and_type() {
    let (store, _dir) = test_store().await;
    let idle = SqlQueue::new(store.clone(), fast_config());
    let inst = instance("SendEmail");
    assert!(matches!(
        idle.add(&inst).await,
        Err(JobQueueError::NotListening)
    ));

    let queue = listening(&store, vec![StaticExecutor::ok().named("SendEmail")]).await;
    assert!(matches!(
        queue.add(&instance("nope")).await,
        Err(JobQueueError::UnknownJobType(_))
    ));
    queue.shutdown().await;
}

#[tokio::test]
async fn remove_cancels_scheduled_unit() {
    let (store, _dir) = test_store().await;
    let queue = listening(&store, vec![StaticExecutor::ok().named("SendEmail")]).await;

    let inst = instance("SendEmail").scheduled_for(Utc::now() + chrono::Duration::hours(1));
    seed(&store, &inst).await;
    queue.add(&inst).await.unwrap();
    queue.remove(&inst).await.unwrap();

    let current = store.current_instance(inst.job_id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Cancelled);
    assert!(matches!(
        queue.remove(&inst).await,
        Err(JobQueueError::NotFound(_))
    ));
    queue.shutdown().await;
}

#[tokio::test]
async fn kill_interrupts_running_unit() {
    let (store, _dir) = test_store().await;
    let queue = listening(
        &store,
        vec![StaticExecutor::interruptible().named("SendEmail")],
    )
    .await;

    let inst = instance("SendEmail");
    seed(&store, &inst).await;
    queue.add(&inst).await.unwrap();
    wait_for(&store, inst.job_id, JobStatus::Running).await;

    assert!(matches!(
        queue.remove(&inst).await,
        Err(JobQueueError::AlreadyStarted(_))
    ));
    queue.kill(&inst).await.unwrap();
    let killed = wait_for(&store, inst.job_id, JobStatus::Killed).await;
    assert!(killed.log.contains(KILLED_LOG_LINE));
    assert!(matches!(
        queue.kill(&inst).await,
        Err(JobQueueError::NotRunning(_))
    ));
    queue.shutdown().await;
}

#[tokio::test]
async fn persisted_kill_reaches_another_worker() {
    let (store, _dir) = test_store().await;
    let worker = listening(
        &store,
        vec![StaticExecutor::interruptible().named("SendEmail")],
    )
    .await;

    let inst = instance("SendEmail");
    seed(&store, &inst).await;
    worker.add(&inst).await.unwrap();
    wait_for(&store, inst.job_id, JobStatus::Running).await;

    // A second process only writes the flag; the owning worker's heartbeat
    // picks it up.
    assert!(store.request_kill(inst.id).await.unwrap());
    wait_for(&store, inst.job_id, JobStatus::Killed).await;
    worker.shutdown().await;
}

#[tokio::test]
async fn default_heartbeat_sees_foreign_kill_within_a_refresh_interval() {
    let (store, _dir) = test_store().await;
    let worker = SqlQueue::new(
        store.clone(),
        SqlQueueConfig {
            poll_interval: Duration::from_millis(20),
            ..SqlQueueConfig::default()
        },
    );
    worker
        .listen(
            vec![JobDefinition::new(Arc::new(
                StaticExecutor::interruptible().named("SendEmail"),
            ))],
            Arc::new(StoreResolver::new(store.clone())),
        )
        .await
        .unwrap();
    // The second process serves another type so it never claims the unit.
    let other = listening(&store, vec![StaticExecutor::ok().named("Cleanup")]).await;

    let inst = instance("SendEmail");
    seed(&store, &inst).await;
    worker.add(&inst).await.unwrap();
    wait_for(&store, inst.job_id, JobStatus::Running).await;

    let requested = tokio::time::Instant::now();
    other.kill(&inst).await.unwrap();
    wait_for(&store, inst.job_id, JobStatus::Killed).await;
    let elapsed = requested.elapsed();
    assert!(
        elapsed <= PROGRESS_REFRESH_INTERVAL + Duration::from_millis(500),
        "kill took {elapsed:?}"
    );
    other.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn listen_reaps_orphans_of_dead_workers() {
    let (store, _dir) = test_store().await;
    let inst = instance("SendEmail");
    seed(&store, &inst).await;

    let names = vec!["SendEmail".to_owned()];
    let past = Utc::now() - chrono::Duration::seconds(60);
    store
        .claim_next("dead", &names, past, past + chrono::Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    store
        .transition(inst.id, &[JobStatus::New], JobStatus::Running, None)
        .await
        .unwrap();

    let queue = listening(&store, vec![StaticExecutor::ok().named("SendEmail")]).await;
    let reaped = store.current_instance(inst.job_id).await.unwrap().unwrap();
    assert_eq!(reaped.status, JobStatus::Exception);
    queue.shutdown().await;
}
