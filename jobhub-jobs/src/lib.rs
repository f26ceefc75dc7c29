//! Concrete job types for jobhub.
//!
//! # Job Types
//!
//! - `SendEmail` - Send an email through the configured [`Mailer`]
//! - `backup.create` - Create a database backup in chunks
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use jobhub_engine::{JobEngine, JobStore, MemoryQueue};
//! use jobhub_jobs::register_all;
//!
//! # async fn run(store: JobStore) -> Result<(), jobhub_engine::EngineError> {
//! let engine = JobEngine::new(store, Arc::new(MemoryQueue::new()));
//! register_all(&engine)?;
//! engine.activate().await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
mod error;
pub mod send_email;

use std::sync::Arc;
use std::time::Duration;

use jobhub_engine::{EngineError, JobEngine};

pub use backup::{BackupCreate, BackupKind};
pub use error::JobError;
pub use send_email::{LogMailer, Mailer, SendEmail};

/// Collaborators the job handlers need.
#[derive(Clone)]
pub struct JobsConfig {
    pub mailer: Arc<dyn Mailer>,
    /// Pause between backup chunks.
    pub backup_chunk_delay: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            mailer: Arc::new(LogMailer),
            backup_chunk_delay: Duration::from_millis(100),
        }
    }
}

/// Register every job type with default collaborators.
pub fn register_all(engine: &JobEngine) -> Result<(), EngineError> {
    register_with(engine, JobsConfig::default())
}

pub fn register_with(engine: &JobEngine, config: JobsConfig) -> Result<(), EngineError> {
    engine.register(send_email::job_type(config.mailer)?)?;
    engine.register(backup::job_type(config.backup_chunk_delay)?)?;
    Ok(())
}

/// Job type constants for type-safe job references.
pub mod job_types {
    pub const SEND_EMAIL: &str = "SendEmail";
    pub const BACKUP_CREATE: &str = "backup.create";
}
