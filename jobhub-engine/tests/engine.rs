mod common;

use chrono::Utc;
use jobhub_db::WORKER_LOST_LOG_LINE;
use jobhub_engine::{
    AbortOutcome, EngineError, JobFilter, JobInstance, JobQueueError, JobRecord, JobStatus,
    JobStore, JobType, RegistryError,
};
use serde_json::json;
use uuid::Uuid;

use common::{
    args, count, flaky_harness, harness, harness_on, idle_harness, test_store, wait_for_status,
    wait_until, Backend,
};

macro_rules! on_both_backends {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::Backend::Memory).await
                }
            )*
        }

        mod sql {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::Backend::Sql).await
                }
            )*
        }
    };
}

on_both_backends!(
    submitted_args_reach_the_handler,
    send_email_progress_is_observable,
    abort_scheduled_job_cancels_it,
    abort_running_job_kills_it,
    rerun_only_from_done,
    update_scheduled_job_keeps_one_active_instance,
    update_running_job_waits_for_the_kill,
    orphaned_job_type_is_tolerated,
    abort_terminal_job_is_rejected,
);

async fn active_instances(store: &JobStore, job_id: Uuid) -> Vec<JobInstance> {
    store
        .list_instances(job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.status.is_active())
        .collect()
}

async fn submitted_args_reach_the_handler(backend: Backend) {
    let h = harness(backend).await;
    let job_id = h
        .engine
        .submit("count", args(json!({ "steps": "7" })))
        .await
        .unwrap();

    let done = wait_for_status(&h.engine, job_id, JobStatus::Done).await;
    assert_eq!(done.log, "steps=7");
    assert_eq!(done.progress, 100);

    let detail = h.engine.job(job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Done);
    assert!(detail.type_registered());
    assert_eq!(detail.instance.unwrap().args, r#"{"steps":7}"#);
    h.engine.shutdown().await;
}

async fn send_email_progress_is_observable(backend: Backend) {
    let h = harness(backend).await;
    let job_id = h
        .engine
        .submit("SendEmail", args(json!({ "to": "a@b.com" })))
        .await
        .unwrap();

    let halfway = wait_until(&h.engine, job_id, "halfway", |p| !p.log.is_empty()).await;
    assert_eq!(halfway.status, JobStatus::Running);
    assert_eq!(halfway.progress, 50);
    assert_eq!(halfway.log, "sent half");
    assert!(halfway.should_poll());

    h.gate.add_permits(1);
    let done = wait_for_status(&h.engine, job_id, JobStatus::Done).await;
    assert_eq!(done.progress, 50);
    assert_eq!(done.log, "sent half");
    assert!(!done.should_poll());
    h.engine.shutdown().await;
}

async fn abort_scheduled_job_cancels_it(backend: Backend) {
    let h = harness(backend).await;
    let at = Utc::now() + chrono::Duration::hours(1);
    let job_id = h
        .engine
        .submit_at("count", args(json!({ "steps": 1 })), at)
        .await
        .unwrap();
    assert_eq!(
        h.engine.query_progress(job_id).await.unwrap().status,
        JobStatus::Scheduled
    );

    assert_eq!(h.engine.abort(job_id).await.unwrap(), AbortOutcome::Cancelled);
    let progress = h.engine.query_progress(job_id).await.unwrap();
    assert_eq!(progress.status, JobStatus::Cancelled);

    let err = h.engine.abort(job_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::IllegalTransition { status: JobStatus::Cancelled, operation: "abort", .. }
    ));
    assert_eq!(h.engine.history(job_id).await.unwrap().len(), 1);
    h.engine.shutdown().await;
}

async fn abort_running_job_kills_it(backend: Backend) {
    let h = harness(backend).await;
    let job_id = h
        .engine
        .submit("sleepy", args(json!({ "label": "one" })))
        .await
        .unwrap();
    wait_until(&h.engine, job_id, "running", |p| !p.log.is_empty()).await;

    assert_eq!(
        h.engine.abort(job_id).await.unwrap(),
        AbortOutcome::KillRequested
    );
    let killed = wait_for_status(&h.engine, job_id, JobStatus::Killed).await;
    assert_eq!(killed.log, "waiting as one\njob killed");
    h.engine.shutdown().await;
}

async fn rerun_only_from_done(backend: Backend) {
    let h = harness(backend).await;
    let job_id = h
        .engine
        .submit("count", args(json!({ "steps": 3 })))
        .await
        .unwrap();
    wait_for_status(&h.engine, job_id, JobStatus::Done).await;

    let rerun = h.engine.rerun(job_id).await.unwrap();
    assert_eq!(rerun.job_id, job_id);
    assert_eq!(rerun.status, JobStatus::New);
    assert_eq!(rerun.args, r#"{"steps":3}"#);
    wait_until(&h.engine, job_id, "second run", |p| {
        p.status == JobStatus::Done && p.log == "steps=3"
    })
    .await;
    let history = h.engine.history(job_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].args, history[1].args);
    assert!(history.iter().all(|i| i.status == JobStatus::Done));

    // Not from any other status.
    let at = Utc::now() + chrono::Duration::hours(1);
    let pending = h
        .engine
        .submit_at("count", args(json!({ "steps": 1 })), at)
        .await
        .unwrap();
    assert!(matches!(
        h.engine.rerun(pending).await,
        Err(EngineError::IllegalTransition { status: JobStatus::Scheduled, operation: "rerun", .. })
    ));
    h.engine.abort(pending).await.unwrap();
    assert!(matches!(
        h.engine.rerun(pending).await,
        Err(EngineError::IllegalTransition { status: JobStatus::Cancelled, .. })
    ));
    assert_eq!(h.engine.history(pending).await.unwrap().len(), 1);
    h.engine.shutdown().await;
}

async fn update_scheduled_job_keeps_one_active_instance(backend: Backend) {
    let h = harness(backend).await;
    let at = Utc::now() + chrono::Duration::hours(1);
    let job_id = h
        .engine
        .submit_at("count", args(json!({ "steps": 1 })), at)
        .await
        .unwrap();

    let updated = h
        .engine
        .update(job_id, args(json!({ "steps": 2 })))
        .await
        .unwrap();
    assert_eq!(updated.status, JobStatus::Scheduled);
    assert_eq!(updated.args, r#"{"steps":2}"#);

    let history = h.engine.history(job_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, JobStatus::Cancelled);
    let active = active_instances(h.engine.store(), job_id).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, updated.id);

    // Invalid arguments leave the job untouched.
    let err = h
        .engine
        .update(job_id, args(json!({ "steps": "many" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.engine.history(job_id).await.unwrap().len(), 2);
    h.engine.shutdown().await;
}

async fn update_running_job_waits_for_the_kill(backend: Backend) {
    let h = harness(backend).await;
    let job_id = h
        .engine
        .submit("sleepy", args(json!({ "label": "old" })))
        .await
        .unwrap();
    wait_until(&h.engine, job_id, "running", |p| !p.log.is_empty()).await;

    let updated = h
        .engine
        .update(job_id, args(json!({ "label": "new" })))
        .await
        .unwrap();
    let history = h.engine.history(job_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, JobStatus::Killed);
    assert_eq!(history[1].id, updated.id);
    assert_eq!(active_instances(h.engine.store(), job_id).await.len(), 1);

    wait_until(&h.engine, job_id, "new instance running", |p| {
        p.log == "waiting as new"
    })
    .await;
    h.engine.abort(job_id).await.unwrap();
    wait_for_status(&h.engine, job_id, JobStatus::Killed).await;

    // A terminal job cannot be updated.
    let err = h
        .engine
        .update(job_id, args(json!({ "label": "late" })))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::IllegalTransition { status: JobStatus::Killed, operation: "update", .. }
    ));
    h.engine.shutdown().await;
}

async fn orphaned_job_type_is_tolerated(backend: Backend) {
    let h = harness(backend).await;
    let orphan = JobInstance::new(Uuid::new_v4(), "retired.job", "{}");
    let store = h.engine.store();
    let mut tx = store.begin().await.unwrap();
    JobStore::insert_job(&mut tx, &JobRecord::for_instance(&orphan))
        .await
        .unwrap();
    JobStore::insert_instance(&mut tx, &orphan).await.unwrap();
    tx.commit().await.unwrap();

    let detail = h.engine.job(orphan.job_id).await.unwrap();
    assert!(!detail.type_registered());

    let err = h
        .engine
        .update(orphan.job_id, args(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::JobTypeNotRegistered { ref job_type, .. } if job_type == "retired.job"
    ));

    assert_eq!(
        h.engine.abort(orphan.job_id).await.unwrap(),
        AbortOutcome::Cancelled
    );
    h.engine.shutdown().await;
}

async fn abort_terminal_job_is_rejected(backend: Backend) {
    let h = harness(backend).await;

    let done = h
        .engine
        .submit("count", args(json!({ "steps": 1 })))
        .await
        .unwrap();
    wait_for_status(&h.engine, done, JobStatus::Done).await;

    let failed = h
        .engine
        .submit("broken", args(json!({ "label": "x" })))
        .await
        .unwrap();
    let progress = wait_for_status(&h.engine, failed, JobStatus::Exception).await;
    assert!(progress.log.contains("disk full"));

    let at = Utc::now() + chrono::Duration::hours(1);
    let cancelled = h
        .engine
        .submit_at("count", args(json!({ "steps": 1 })), at)
        .await
        .unwrap();
    h.engine.abort(cancelled).await.unwrap();

    let killed = h
        .engine
        .submit("sleepy", args(json!({ "label": "k" })))
        .await
        .unwrap();
    wait_for_status(&h.engine, killed, JobStatus::Running).await;
    h.engine.abort(killed).await.unwrap();
    wait_for_status(&h.engine, killed, JobStatus::Killed).await;

    for (job_id, terminal) in [
        (done, JobStatus::Done),
        (failed, JobStatus::Exception),
        (cancelled, JobStatus::Cancelled),
        (killed, JobStatus::Killed),
    ] {
        let err = h.engine.abort(job_id).await.unwrap_err();
        assert!(
            matches!(err, EngineError::IllegalTransition { status, .. } if status == terminal),
            "abort of a {terminal} job gave {err:?}"
        );
        assert_eq!(
            h.engine.query_progress(job_id).await.unwrap().status,
            terminal
        );
        assert_eq!(h.engine.history(job_id).await.unwrap().len(), 1);
    }
    h.engine.shutdown().await;
}

async fn insert_job(store: &JobStore, instance: &JobInstance) {
    let mut tx = store.begin().await.unwrap();
    JobStore::insert_job(&mut tx, &JobRecord::for_instance(instance))
        .await
        .unwrap();
    JobStore::insert_instance(&mut tx, instance).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn memory_backend_recovers_jobs_left_by_a_previous_process() {
    let (store, dir) = test_store().await;
    let running = JobInstance::new(Uuid::new_v4(), "sleepy", r#"{"label":"old"}"#);
    let pending = JobInstance::new(Uuid::new_v4(), "count", r#"{"steps":3}"#);
    let scheduled = JobInstance::new(Uuid::new_v4(), "count", r#"{"steps":4}"#)
        .scheduled_for(Utc::now() + chrono::Duration::milliseconds(300));
    for instance in [&running, &pending, &scheduled] {
        insert_job(&store, instance).await;
    }
    assert!(store
        .transition(running.id, &[JobStatus::New], JobStatus::Running, None)
        .await
        .unwrap());

    let h = harness_on(Backend::Memory, store, dir).await;

    let lost = h.engine.query_progress(running.job_id).await.unwrap();
    assert_eq!(lost.status, JobStatus::Exception);
    assert!(lost.log.contains(WORKER_LOST_LOG_LINE));
    assert!(matches!(
        h.engine.abort(running.job_id).await,
        Err(EngineError::IllegalTransition { status: JobStatus::Exception, .. })
    ));

    let progress = wait_for_status(&h.engine, pending.job_id, JobStatus::Done).await;
    assert!(progress.log.contains("steps=3"));

    let progress = wait_for_status(&h.engine, scheduled.job_id, JobStatus::Done).await;
    assert!(progress.log.contains("steps=4"));
    let history = h.engine.history(scheduled.job_id).await.unwrap();
    assert!(history[0].started_at.unwrap() >= scheduled.scheduled_at.unwrap());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn failed_enqueue_rolls_back() {
    let (h, queue) = flaky_harness().await;
    let store = h.engine.store();

    queue.fail_adds(true);
    let err = h
        .engine
        .submit("count", args(json!({ "steps": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Queue(JobQueueError::Unavailable)));
    assert_eq!(store.count_jobs(None).await.unwrap(), 0);

    queue.fail_adds(false);
    let done = h
        .engine
        .submit("count", args(json!({ "steps": 1 })))
        .await
        .unwrap();
    wait_for_status(&h.engine, done, JobStatus::Done).await;
    let at = Utc::now() + chrono::Duration::hours(1);
    let scheduled = h
        .engine
        .submit_at("count", args(json!({ "steps": 2 })), at)
        .await
        .unwrap();

    queue.fail_adds(true);
    assert!(matches!(
        h.engine.rerun(done).await,
        Err(EngineError::Queue(JobQueueError::Unavailable))
    ));
    let history = h.engine.history(done).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Done);

    // The abort half of the update stands; the replacement instance does not.
    assert!(matches!(
        h.engine.update(scheduled, args(json!({ "steps": 5 }))).await,
        Err(EngineError::Queue(JobQueueError::Unavailable))
    ));
    let history = h.engine.history(scheduled).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Cancelled);
    assert!(active_instances(store, scheduled).await.is_empty());
    assert_eq!(store.count_jobs(None).await.unwrap(), 2);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn registry_is_frozen_by_activation() {
    let h = idle_harness(Backend::Memory).await;
    assert!(matches!(
        h.engine.register(count()),
        Err(EngineError::Registry(RegistryError::DuplicateJobType(_)))
    ));
    assert!(matches!(
        h.engine.submit("count", args(json!({ "steps": 1 }))).await,
        Err(EngineError::NotActivated)
    ));

    h.engine.activate().await.unwrap();
    assert!(matches!(
        h.engine.activate().await,
        Err(EngineError::AlreadyActivated)
    ));
    let names: Vec<_> = h.engine.job_types().into_iter().map(|t| t.name).collect();
    assert_eq!(names, ["SendEmail", "broken", "count", "sleepy"]);
    for name in &names {
        assert!(h.engine.registry().lookup(name).is_some());
    }

    let late = JobType::builder("late")
        .serde_args::<common::Sleepy>()
        .handler(|_ctx: jobhub_engine::JobContext<common::Sleepy>| async { Ok(()) })
        .build()
        .unwrap();
    assert!(matches!(
        h.engine.register(late),
        Err(EngineError::Registry(RegistryError::RegistryFrozen(_)))
    ));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn malformed_arguments_create_no_job() {
    let h = harness(Backend::Memory).await;
    let err = h
        .engine
        .submit("count", args(json!({ "steps": "abc" })))
        .await
        .unwrap_err();
    let EngineError::Validation(errors) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(errors.get("steps").unwrap().code, "invalid_number");

    let err = h
        .engine
        .submit("SendEmail", args(json!({ "to": "not-an-address" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(matches!(
        h.engine.submit("nope", args(json!({}))).await,
        Err(EngineError::UnknownJobType(name)) if name == "nope"
    ));
    assert_eq!(h.engine.store().count_jobs(None).await.unwrap(), 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn unknown_job_id_is_not_found() {
    let h = harness(Backend::Memory).await;
    let missing = Uuid::new_v4();
    assert!(matches!(
        h.engine.query_progress(missing).await,
        Err(EngineError::JobNotFound(id)) if id == missing
    ));
    assert!(matches!(
        h.engine.abort(missing).await,
        Err(EngineError::JobNotFound(_))
    ));
    assert!(matches!(
        h.engine.history(missing).await,
        Err(EngineError::JobNotFound(_))
    ));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let h = harness(Backend::Memory).await;
    let done = h
        .engine
        .submit("count", args(json!({ "steps": 1 })))
        .await
        .unwrap();
    wait_for_status(&h.engine, done, JobStatus::Done).await;
    let at = Utc::now() + chrono::Duration::hours(1);
    h.engine
        .submit_at("count", args(json!({ "steps": 2 })), at)
        .await
        .unwrap();

    let (all, total) = h.engine.list_jobs(&JobFilter::default()).await.unwrap();
    assert_eq!((all.len(), total), (2, 2));

    let filter = JobFilter {
        status: Some(JobStatus::Done),
        ..JobFilter::default()
    };
    let (jobs, total) = h.engine.list_jobs(&filter).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(jobs[0].id, done);
    h.engine.shutdown().await;
}
