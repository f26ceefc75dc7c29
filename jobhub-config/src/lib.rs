use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for `worker.heartbeat_secs`. A kill requested by another
/// process reaches the worker on its next heartbeat, and observers poll
/// progress every two seconds.
pub const MAX_HEARTBEAT_SECS: u64 = 2;

/// Pre-compiled regex for hostname validation (compiled once at first use)
static HOSTNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9\.]*[a-zA-Z0-9]$").unwrap());

#[derive(Debug, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub worker: Option<WorkerSection>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    #[serde(default)]
    pub backend: Option<WorkerBackend>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub lease_secs: Option<u64>,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub reap_interval_secs: Option<u64>,
    #[serde(default)]
    pub kill_grace_secs: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

/// Parse configuration from a string with optional format hint
#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try each enabled format in turn.
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s;
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Which queue backend executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerBackend {
    /// Durable queue on the job tables; survives restarts.
    Sql,
    /// In-process queue; queued work is lost on restart.
    Memory,
}

impl WorkerBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for WorkerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(Self::Sql),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown worker backend `{other}`")),
        }
    }
}

/// Concrete application configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerConfig {
    pub backend: WorkerBackend,
    /// Lease owner name; generated per process when unset.
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub heartbeat_secs: u64,
    pub reap_interval_secs: u64,
    /// How long an update waits for a killed instance to stop.
    pub kill_grace_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 6000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            database: DatabaseConfig {
                url: "sqlite://jobhub.sqlite".to_string(),
                max_connections: 10,
                busy_timeout_ms: 5000,
            },
            worker: WorkerConfig {
                backend: WorkerBackend::Sql,
                worker_id: None,
                concurrency: 4,
                poll_interval_ms: 500,
                lease_secs: 30,
                heartbeat_secs: MAX_HEARTBEAT_SECS,
                reap_interval_secs: 15,
                kill_grace_secs: 10,
            },
        }
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(()),
    }
}

/// Helper macro to apply optional value if present
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        apply_file(&mut cfg, load_raw_from_file(p)?);
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

fn apply_file(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(server) = raw.server {
        apply_opt!(cfg.server.host, server.host);
        apply_opt!(cfg.server.port, server.port);
    }
    if let Some(logging) = raw.logging {
        apply_opt!(cfg.logging.level, logging.level);
        apply_opt!(cfg.logging.json, logging.json);
    }
    if let Some(db) = raw.database {
        apply_opt!(cfg.database.url, db.url);
        apply_opt!(cfg.database.max_connections, db.max_connections);
        apply_opt!(cfg.database.busy_timeout_ms, db.busy_timeout_ms);
    }
    if let Some(w) = raw.worker {
        apply_opt!(cfg.worker.backend, w.backend);
        apply_opt!(cfg.worker.worker_id, w.worker_id, wrap);
        apply_opt!(cfg.worker.concurrency, w.concurrency);
        apply_opt!(cfg.worker.poll_interval_ms, w.poll_interval_ms);
        apply_opt!(cfg.worker.lease_secs, w.lease_secs);
        apply_opt!(cfg.worker.heartbeat_secs, w.heartbeat_secs);
        apply_opt!(cfg.worker.reap_interval_secs, w.reap_interval_secs);
        apply_opt!(cfg.worker.kill_grace_secs, w.kill_grace_secs);
    }
}

/// Helper to parse env var as a specific type
#[inline]
fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Helper to parse env var as bool
#[inline]
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {}", key))),
        Err(_) => Ok(None),
    }
}

/// Helper to get env var as string
#[inline]
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Apply all environment variable overrides to config
fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    // Server
    if let Some(v) = env_str("JOBHUB_SERVER_HOST") {
        cfg.server.host = v;
    }
    if let Some(v) = env_parse::<u16>("JOBHUB_SERVER_PORT")? {
        cfg.server.port = v;
    }

    // Logging
    if let Some(v) = env_str("JOBHUB_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_bool("JOBHUB_LOG_JSON")? {
        cfg.logging.json = v;
    }

    // Database
    if let Some(v) = env_str("JOBHUB_DATABASE_URL") {
        cfg.database.url = v;
    }
    if let Some(v) = env_parse::<u32>("JOBHUB_DB_MAX_CONNECTIONS")? {
        cfg.database.max_connections = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_DB_BUSY_TIMEOUT_MS")? {
        cfg.database.busy_timeout_ms = v;
    }

    // Worker
    if let Some(v) = env_parse::<WorkerBackend>("JOBHUB_WORKER_BACKEND")? {
        cfg.worker.backend = v;
    }
    if let Some(v) = env_str("JOBHUB_WORKER_ID") {
        cfg.worker.worker_id = Some(v);
    }
    if let Some(v) = env_parse::<usize>("JOBHUB_WORKER_CONCURRENCY")? {
        cfg.worker.concurrency = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_WORKER_POLL_INTERVAL_MS")? {
        cfg.worker.poll_interval_ms = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_WORKER_LEASE_SECS")? {
        cfg.worker.lease_secs = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_WORKER_HEARTBEAT_SECS")? {
        cfg.worker.heartbeat_secs = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_WORKER_REAP_INTERVAL_SECS")? {
        cfg.worker.reap_interval_secs = v;
    }
    if let Some(v) = env_parse::<u64>("JOBHUB_WORKER_KILL_GRACE_SECS")? {
        cfg.worker.kill_grace_secs = v;
    }

    Ok(())
}

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.port == 0 {
        return Err(ConfigError::Validation("server.port must be > 0".into()));
    }
    let host_ok = cfg.server.host.parse::<std::net::IpAddr>().is_ok()
        || HOSTNAME_REGEX.is_match(&cfg.server.host);
    if !host_ok {
        return Err(ConfigError::Validation(format!(
            "invalid server.host: {}",
            cfg.server.host
        )));
    }

    if !cfg.database.url.starts_with("sqlite:") {
        return Err(ConfigError::Validation(format!(
            "database.url must be a sqlite: url, got {}",
            cfg.database.url
        )));
    }
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be > 0".into(),
        ));
    }

    let w = &cfg.worker;
    if w.concurrency == 0 {
        return Err(ConfigError::Validation(
            "worker.concurrency must be > 0".into(),
        ));
    }
    if w.backend == WorkerBackend::Sql {
        if w.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "worker.poll_interval_ms must be > 0".into(),
            ));
        }
        if w.heartbeat_secs == 0 || w.heartbeat_secs >= w.lease_secs {
            return Err(ConfigError::Validation(format!(
                "worker.heartbeat_secs ({}) must be > 0 and shorter than worker.lease_secs ({})",
                w.heartbeat_secs, w.lease_secs
            )));
        }
        if w.heartbeat_secs > MAX_HEARTBEAT_SECS {
            return Err(ConfigError::Validation(format!(
                "worker.heartbeat_secs ({}) must not exceed {MAX_HEARTBEAT_SECS}",
                w.heartbeat_secs
            )));
        }
        if w.reap_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "worker.reap_interval_secs must be > 0".into(),
            ));
        }
    }
    Ok(())
}
