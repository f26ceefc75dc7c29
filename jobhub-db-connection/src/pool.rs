use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::sanitize_database_url;

pub type DbPool = SqlitePool;

// SQLite memory database patterns for efficient checking
pub const SQLITE_MEMORY_PATTERNS: &[&[u8]] = &[b":memory:", b"mode=memory"];

/// Creates a new SQLite connection pool using the provided configuration.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    let url = config.url.trim();
    if url.is_empty() {
        return Err(DbConnectionError::EmptyDatabaseUrl);
    }
    let safe_url = sanitize_database_url(url);
    debug!(database_url = %safe_url, "creating database pool");

    let in_memory = is_memory_url(url);
    if !in_memory {
        ensure_parent_dir_exists(url)?;
    }

    let mut connect = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout());
    if config.wal && !in_memory {
        connect = connect.journal_mode(SqliteJournalMode::Wal);
    }

    let mut opts = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout());
    if let Some(idle) = config.idle_timeout() {
        opts = opts.idle_timeout(idle);
    }

    let pool = opts.connect_with(connect).await?;
    info!(
        database_url = %safe_url,
        max_connections = config.max_connections,
        wal = config.wal && !in_memory,
        "database pool ready"
    );
    Ok(pool)
}

pub(crate) fn is_memory_url(url: &str) -> bool {
    let url_bytes = url.as_bytes();
    SQLITE_MEMORY_PATTERNS.iter().any(|&pattern| {
        url_bytes
            .windows(pattern.len())
            .any(|w| w.eq_ignore_ascii_case(pattern))
    })
}

/// Extract the file path from a SQLite connection URL.
/// Returns None for in-memory databases or empty paths.
pub(crate) fn extract_path(url: &str) -> Option<&str> {
    if is_memory_url(url) {
        return None;
    }

    let mut path = url;
    path = path
        .strip_prefix("sqlite://")
        .or_else(|| path.strip_prefix("sqlite:"))
        .unwrap_or(path);
    path = path.strip_prefix("//").unwrap_or(path);
    path = path.strip_prefix("file:").unwrap_or(path);

    if let Some(idx) = path.find('?') {
        path = &path[..idx];
    }

    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    // On Windows: strip leading slash before drive letter ("/C:/...")
    if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
        Some(&path[1..])
    } else {
        Some(path)
    }
}

/// sqlx creates the database file itself but not missing parent directories.
fn ensure_parent_dir_exists(database_url: &str) -> Result<(), DbConnectionError> {
    use std::fs::create_dir_all;
    use std::path::Path;

    let Some(clean_path) = extract_path(database_url) else {
        return Ok(());
    };

    if let Some(parent) = Path::new(clean_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        create_dir_all(parent).map_err(|e| {
            DbConnectionError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}
