use std::sync::Arc;
use std::time::Duration;

use jobhub_db::{create_pool, DbConnectionConfig};
use jobhub_engine::{EngineError, JobEngine, JobStatus, JobStore, MemoryQueue, RawArgs};
use jobhub_jobs::{job_types, register_all, register_with, JobsConfig};
use serde_json::json;

async fn engine() -> (JobEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let pool = create_pool(&DbConnectionConfig::new(url)).await.unwrap();
    jobhub_migrations::sqlite_migrator().run(&pool).await.unwrap();
    let engine = JobEngine::new(JobStore::new(pool), Arc::new(MemoryQueue::new()));
    (engine, dir)
}

#[tokio::test]
async fn registers_every_job_type_once() {
    let (engine, _dir) = engine().await;
    register_all(&engine).unwrap();
    let names: Vec<_> = engine.job_types().into_iter().map(|t| t.name).collect();
    assert_eq!(names, [job_types::SEND_EMAIL, job_types::BACKUP_CREATE]);
    assert!(matches!(
        register_all(&engine),
        Err(EngineError::Registry(_))
    ));
}

#[tokio::test]
async fn backup_runs_to_completion() {
    let (engine, _dir) = engine().await;
    register_with(
        &engine,
        JobsConfig {
            backup_chunk_delay: Duration::ZERO,
            ..JobsConfig::default()
        },
    )
    .unwrap();
    engine.activate().await.unwrap();

    let raw = RawArgs::from_json(json!({ "kind": "full", "steps": 5 })).unwrap();
    let job_id = engine.submit(job_types::BACKUP_CREATE, raw).await.unwrap();

    let mut progress = engine.query_progress(job_id).await.unwrap();
    for _ in 0..200 {
        if progress.status == JobStatus::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        progress = engine.query_progress(job_id).await.unwrap();
    }
    assert_eq!(progress.status, JobStatus::Done);
    assert_eq!(progress.progress, 100);
    assert!(progress.log.ends_with("backup complete"));
    engine.shutdown().await;
}
