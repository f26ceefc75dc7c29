use std::env::{self, VarError};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DbConnectionError;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for the SQLite connection pool backing the job store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConnectionConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Use write-ahead logging so pollers can read while a writer commits.
    pub wal: bool,
}

impl Default for DbConnectionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            wal: true,
        }
    }
}

impl DbConnectionConfig {
    /// Creates a new configuration with the provided URL and sane defaults.
    #[inline]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables using the supplied prefix.
    ///
    /// Expected variables:
    /// - `{PREFIX}_DATABASE_URL` (required)
    /// - `{PREFIX}_DB_MAX_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_MIN_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_CONNECT_TIMEOUT_SECS` (optional)
    /// - `{PREFIX}_DB_IDLE_TIMEOUT_SECS` (optional)
    /// - `{PREFIX}_DB_BUSY_TIMEOUT_MS` (optional)
    /// - `{PREFIX}_DB_WAL` (optional, bool)
    pub fn from_env(prefix: &str) -> Result<Self, DbConnectionError> {
        let url_var = format!("{prefix}_DATABASE_URL");
        let url =
            env::var(&url_var).map_err(|_| DbConnectionError::MissingEnvVar(url_var.clone()))?;
        if url.trim().is_empty() {
            return Err(DbConnectionError::EmptyDatabaseUrl);
        }

        let mut config = Self::new(url);

        if let Some(max) = maybe_parse(prefix, "DB_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(min) = maybe_parse(prefix, "DB_MIN_CONNECTIONS")? {
            config.min_connections = min;
        }
        if let Some(connect_timeout) = maybe_parse(prefix, "DB_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout_secs = connect_timeout;
        }
        if let Some(idle_timeout) = maybe_parse(prefix, "DB_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout_secs = Some(idle_timeout);
        }
        if let Some(busy) = maybe_parse(prefix, "DB_BUSY_TIMEOUT_MS")? {
            config.busy_timeout_ms = busy;
        }
        if let Some(wal) = maybe_parse_bool(prefix, "DB_WAL")? {
            config.wal = wal;
        }

        config.validate(prefix)?;
        Ok(config)
    }

    fn validate(&self, prefix: &str) -> Result<(), DbConnectionError> {
        if self.max_connections == 0 {
            return Err(DbConnectionError::InvalidPoolSize {
                var: format!("{prefix}_DB_MAX_CONNECTIONS"),
                reason: "max_connections must be greater than 0",
            });
        }
        if self.min_connections > self.max_connections {
            return Err(DbConnectionError::InvalidPoolSize {
                var: format!("{prefix}_DB_MIN_CONNECTIONS"),
                reason: "min_connections must not exceed max_connections",
            });
        }
        Ok(())
    }

    #[inline]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    #[inline]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn read_var(var_name: &str) -> Result<Option<String>, DbConnectionError> {
    match env::var(var_name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_owned()))
            }
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(DbConnectionError::InvalidUnicode(var_name.to_owned())),
    }
}

fn maybe_parse<T>(prefix: &str, suffix: &str) -> Result<Option<T>, DbConnectionError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    let var = format!("{prefix}_{suffix}");
    match read_var(&var)? {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|source| DbConnectionError::InvalidNumber { var, source }),
        None => Ok(None),
    }
}

fn maybe_parse_bool(prefix: &str, suffix: &str) -> Result<Option<bool>, DbConnectionError> {
    let var = format!("{prefix}_{suffix}");
    let Some(value) = read_var(&var)? else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(DbConnectionError::InvalidBoolean { var, value }),
    }
}
