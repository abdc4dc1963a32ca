//! SQLite connection handling for the metadata store
//!
//! The schema ships embedded in the binary and is applied at connect time;
//! every statement in it is written to be re-runnable, so opening an
//! existing database is a no-op apart from the pragma setup.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::StoreError;

/// Embedded schema, applied on every connect
const SCHEMA: &str = include_str!("migrations/0001_initial.sql");

/// All writers contend on one file; wait for the lock instead of erroring
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONNECTIONS: u32 = 5;

/// Owns the SQLite pool behind [`SqliteStateStore`](crate::SqliteStateStore)
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open (or create) the state database at `path`
    ///
    /// Missing parent directories are created. The database runs in WAL
    /// mode so queue workers can read while a cycle commits.
    ///
    /// # Errors
    /// `StoreError::ConnectionFailed` when the file or its directory cannot
    /// be opened, `StoreError::MigrationFailed` when the schema does not
    /// apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "cannot create state directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = connect(options, MAX_CONNECTIONS).await?;
        info!(path = %path.display(), "state database ready");
        Ok(Self { pool })
    }

    /// Open a private in-memory database
    ///
    /// Restricted to a single connection: SQLite gives each connection its
    /// own in-memory database, so a second connection would see an empty
    /// schema.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        let pool = connect(options, 1).await?;
        debug!("in-memory state database ready");
        Ok(Self { pool })
    }

    /// Handle to the underlying pool
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn connect(options: SqliteConnectOptions, max: u32) -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    Ok(pool)
}

// ============================================================================
// Tests
// ============================================================================
