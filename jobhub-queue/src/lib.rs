//! Queue backend abstraction and execution contract for jobhub.
//!
//! This crate defines what a queue backend must do and what it hands to job
//! handlers while they run. It knows nothing about where job records live:
//! persistence is reached through the [`JobHandle`] and [`InstanceResolver`]
//! traits, which the store crate implements.
//!
//! # Architecture
//!
//! - [`QueueBackend`] - Pluggable transport (`listen`, `add`, `remove`, `kill`)
//! - [`JobExecutor`] - Trait for implementing job handlers
//! - [`ProgressReporter`] - Handler-facing log/progress writer with interrupt flag
//! - [`execute_unit`] - The execution callback every backend runs per unit
//! - [`MemoryQueue`] - In-process backend
//!
//! # Example
//!
//! ```rust,no_run
//! use jobhub_queue::{async_trait, JobExecutor, JobQueueError, ProgressReporter};
//!
//! struct MyJobExecutor;
//!
//! #[async_trait]
//! impl JobExecutor for MyJobExecutor {
//!     fn job_type(&self) -> &str {
//!         "my.job"
//!     }
//!
//!     async fn execute(&self, reporter: ProgressReporter) -> Result<(), JobQueueError> {
//!         for step in 1..=10 {
//!             reporter.check_interrupted()?;
//!             reporter.append_log(format!("step {step}")).await?;
//!             reporter.set_progress(step * 10).await?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

mod backend;
mod error;
mod executor;
mod handle;
mod memory;
mod reporter;
mod runner;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backend::QueueBackend;
pub use error::JobQueueError;
pub use executor::{JobDefinition, JobExecutor, NoOpExecutor};
pub use handle::{InstanceResolver, JobHandle};
pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use reporter::ProgressReporter;
pub use runner::{execute_unit, KILLED_LOG_LINE};
pub use types::{clip_progress, JobInstance, JobProgress, JobStatus, PROGRESS_REFRESH_INTERVAL};

// Re-export for implementors of the traits above.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
