//! SQLite persistence for jobhub: the job record store and the durable
//! queue backend that runs units straight off the `job_instances` table.

pub type DbBackend = sqlx::Sqlite;

mod error;
mod handle;
pub mod queries;
mod rows;
mod sql_queue;
mod store;

pub use error::StoreError;
pub use handle::{StoreResolver, StoredJobHandle};
pub use rows::{JobFilter, JobRecord};
pub use sql_queue::{SqlQueue, SqlQueueConfig};
pub use store::{JobStore, LEASE_EXPIRED_LOG_LINE, WORKER_LOST_LOG_LINE};

pub use jobhub_db_connection::{create_pool, DbConnectionConfig, DbConnectionError, DbPool};
