//! SQLite connection pool.
//!
//! Every new connection gets WAL mode, foreign keys and the configured
//! busy timeout via [`PragmaCustomizer`]. The schema is applied once when
//! the pool is opened.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracelens_settings::DatabaseSettings;
use tracing::info;

use crate::errors::{Result, StoreError};
use crate::schema;

pub type ConnectionPool = Pool<SqliteConnectionManager>;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    /// Longest wait for a free pooled connection.
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            pool_size: settings.pool_size.max(1),
            busy_timeout_ms: settings.busy_timeout_ms,
            connection_timeout: Duration::from_millis(settings.operation_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u64,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_millis(self.busy_timeout_ms))?;
        conn.execute_batch(schema::PRAGMAS)
    }
}

/// Open (or create) a file-backed pool and apply the schema.
pub fn open_file(path: &Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
    }

    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.connection_timeout)
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(SqliteConnectionManager::file(path))?;

    schema::migrate(&*pool.get()?)?;
    info!(path = %path.display(), pool_size = config.pool_size, "database opened");
    Ok(pool)
}

/// In-memory pool for tests. Each SQLite memory connection is its own
/// database, so the pool holds exactly one connection and never recycles it.
pub fn open_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let pool = Pool::builder()
        .max_size(1)
        .min_idle(Some(1))
        .idle_timeout(None)
        .max_lifetime(None)
        .connection_timeout(config.connection_timeout)
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(SqliteConnectionManager::memory())?;

    schema::migrate(&*pool.get()?)?;
    Ok(pool)
}

pub(crate) fn memory_path() -> PathBuf {
    PathBuf::from(":memory:")
}
