use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use jobhub_config::{Config, WorkerBackend};
use jobhub_db::{DbConnectionConfig, JobStore, SqlQueue, SqlQueueConfig};
use jobhub_engine::EngineConfig;
use jobhub_queue::{MemoryQueue, MemoryQueueConfig, QueueBackend};

/// Build database connection config from application config.
///
/// `JOBHUB_DATABASE_URL` switches to the full `JOBHUB_DB_*` pool settings.
pub fn database_config_from_config(cfg: &Config) -> DbConnectionConfig {
    if std::env::var_os("JOBHUB_DATABASE_URL").is_some() {
        match DbConnectionConfig::from_env("JOBHUB") {
            Ok(config) => return config,
            Err(error) => {
                tracing::warn!(%error, "ignoring JOBHUB_DB_* pool settings");
            }
        }
    }
    let mut db = DbConnectionConfig::new(cfg.database.url.clone());
    db.max_connections = cfg.database.max_connections;
    db.busy_timeout_ms = cfg.database.busy_timeout_ms;
    db
}

/// Build the queue backend selected by `worker.backend`.
pub fn queue_from_config(cfg: &Config, store: &JobStore) -> Arc<dyn QueueBackend> {
    let w = &cfg.worker;
    match w.backend {
        WorkerBackend::Sql => {
            let mut queue_cfg = SqlQueueConfig {
                concurrency: w.concurrency,
                poll_interval: w.poll_interval(),
                lease: w.lease(),
                heartbeat: w.heartbeat(),
                reap_interval: w.reap_interval(),
                ..SqlQueueConfig::default()
            };
            if let Some(id) = &w.worker_id {
                queue_cfg.worker_id = id.clone();
            }
            Arc::new(SqlQueue::new(store.clone(), queue_cfg))
        }
        WorkerBackend::Memory => Arc::new(MemoryQueue::with_config(MemoryQueueConfig {
            concurrency: w.concurrency,
            ..MemoryQueueConfig::default()
        })),
    }
}

pub fn engine_config_from_config(cfg: &Config) -> EngineConfig {
    EngineConfig {
        kill_grace: cfg.worker.kill_grace(),
        ..EngineConfig::default()
    }
}

/// Parse host:port into a SocketAddr, with fallback to 0.0.0.0.
pub fn parse_bind_address(host: &str, port: u16) -> SocketAddr {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .or_else(|_| host.parse::<SocketAddr>())
        .or_else(|_| host.parse::<Ipv6Addr>().map(|ip| SocketAddr::new(IpAddr::V6(ip), port)))
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}
