//! Job engine for jobhub.
//!
//! Job types are described with [`JobType::builder`], registered on a
//! [`JobEngine`], and frozen by [`JobEngine::activate`]. From then on the
//! engine submits, aborts, reruns and updates jobs against the record store
//! and the configured queue backend.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use jobhub_engine::{JobArgs, JobContext, JobEngine, JobType, MemoryQueue, RawArgs};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! impl JobArgs for Greet {}
//!
//! # async fn run(store: jobhub_engine::JobStore) -> Result<(), jobhub_engine::EngineError> {
//! let engine = JobEngine::new(store, Arc::new(MemoryQueue::new()));
//! engine.register(
//!     JobType::builder("greet")
//!         .description("Say hello")
//!         .serde_args::<Greet>()
//!         .handler(|ctx: JobContext<Greet>| async move {
//!             ctx.append_log(format!("hello {}", ctx.args.name)).await
//!         })
//!         .build()?,
//! )?;
//! engine.activate().await?;
//!
//! let raw = RawArgs::from_json(serde_json::json!({ "name": "world" }))?;
//! let job_id = engine.submit("greet", raw).await?;
//! let progress = engine.query_progress(job_id).await?;
//! # let _ = progress;
//! # Ok(())
//! # }
//! ```

mod args;
mod codec;
mod context;
mod engine;
mod error;
mod registry;

pub use args::{JobArgs, RawArgs, ValidationErrors, ValidationIssue, GENERAL_FIELD};
pub use codec::{ArgsCodec, CodecError, JsonCodec};
pub use context::JobContext;
pub use engine::{AbortOutcome, EngineConfig, JobDetail, JobEngine};
pub use error::{EngineError, RegistryError};
pub use registry::{ErasedJobType, HandlerFuture, JobRegistry, JobType, JobTypeBuilder, JobTypeInfo};

pub use jobhub_db::{JobFilter, JobRecord, JobStore, SqlQueue, SqlQueueConfig, StoreError};
pub use jobhub_queue::{
    JobInstance, JobProgress, JobQueueError, JobStatus, MemoryQueue, MemoryQueueConfig,
    ProgressReporter, QueueBackend,
};
