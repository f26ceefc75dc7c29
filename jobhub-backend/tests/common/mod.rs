#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use jobhub_backend::{build_router, state::AppState};
use jobhub_db::{create_pool, DbConnectionConfig, JobStore};
use jobhub_engine::{JobEngine, MemoryQueue};
use jobhub_jobs::JobsConfig;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub struct TestApp {
    pub router: Router,
    pub engine: Arc<JobEngine>,
    _dir: TempDir,
}

/// Router over a temp-file database with every job type registered and the
/// in-memory queue listening.
pub async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("api.db").display());
    let pool = create_pool(&DbConnectionConfig::new(url))
        .await
        .expect("create pool");
    jobhub_migrations::sqlite_migrator()
        .run(&pool)
        .await
        .expect("migrations");

    let engine = Arc::new(JobEngine::new(
        JobStore::new(pool),
        Arc::new(MemoryQueue::new()),
    ));
    let jobs = JobsConfig {
        backup_chunk_delay: Duration::from_millis(5),
        ..JobsConfig::default()
    };
    jobhub_jobs::register_with(&engine, jobs).expect("register jobs");
    engine.activate().await.expect("activate");

    TestApp {
        router: build_router(Arc::new(AppState::new(Arc::clone(&engine)))),
        engine,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    /// Submit and return the new job id.
    pub async fn submit(&self, body: Value) -> String {
        let (status, json) = self.post("/api/jobs", body).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().expect("id").to_string()
    }

    /// Poll the progress feed until the job reaches `status`.
    pub async fn wait_for_status(&self, job_id: &str, status: &str) -> Value {
        let uri = format!("/api/jobs/{job_id}/progress");
        let mut last = Value::Null;
        for _ in 0..300 {
            let (code, json) = self.get(&uri).await;
            assert_eq!(code, StatusCode::OK, "{json}");
            if json["status"] == status {
                return json;
            }
            last = json;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}, last progress: {last}");
    }
}
