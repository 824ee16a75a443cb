//! SQLite pool construction for the mikroscope sidecar.
//!
//! The index database is a single SQLite file opened in WAL mode with
//! NORMAL synchronous writes. All crates share one pool; SQLite's own
//! transaction machinery serializes writers.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Database pool errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid database path: {0}")]
    InvalidPath(String),
}

/// Pool type alias shared by every consumer.
pub type DbPool = sqlx::SqlitePool;

/// Row type alias for ad-hoc queries.
pub type DbRow = sqlx::sqlite::SqliteRow;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum connections in the pool.
    pub max_connections: u32,
}

impl DbConfig {
    /// Configuration for an on-disk database file (created if missing).
    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if display.is_empty() {
            return Err(DbError::InvalidPath(display));
        }
        Ok(Self {
            url: format!("sqlite:{display}?mode=rwc"),
            max_connections: 5,
        })
    }

    /// In-memory configuration for tests.
    ///
    /// A single connection keeps the in-memory database alive for the
    /// whole pool lifetime.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a pool and apply the SQLite pragmas the sidecar relies on.
pub async fn create_pool(config: DbConfig) -> Result<DbPool, DbError> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    apply_sqlite_pragmas(&pool).await?;

    debug!(url = %config.url, "connected to index database");
    Ok(pool)
}

/// WAL journal for concurrent readers, NORMAL sync, cascade enforcement.
async fn apply_sqlite_pragmas(pool: &DbPool) -> Result<(), DbError> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;
    Ok(())
}
