use jobhub_db::{create_pool, DbConnectionConfig, JobRecord, JobStore};
use jobhub_queue::JobInstance;
use tempfile::TempDir;
use uuid::Uuid;

/// A migrated store backed by a SQLite file that lives as long as the guard.
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

/// Insert a job plus its first instance and commit.
pub async fn seed(store: &JobStore, instance: &JobInstance) {
    let mut tx = store.begin().await.unwrap();
    JobStore::insert_job(&mut tx, &JobRecord::for_instance(instance))
        .await
        .unwrap();
    JobStore::insert_instance(&mut tx, instance).await.unwrap();
    tx.commit().await.unwrap();
}

#[allow(dead_code)]
pub fn instance(name: &str) -> JobInstance {
    JobInstance::new(Uuid::new_v4(), name, r#"{"n":1}"#)
}
