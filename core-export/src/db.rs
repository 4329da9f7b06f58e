//! # Job Database
//!
//! SQLite pool for export job persistence. Pools open in WAL mode with
//! foreign keys on, apply the embedded `migrations/` and answer a `SELECT 1`
//! before they are handed out.
//!
//! In-memory databases exist per connection, so [`DatabaseConfig::in_memory`]
//! keeps exactly one connection alive for the life of the pool.
//!
//! ```rust,ignore
//! let pool = create_pool(DatabaseConfig::new("exports.db").max_connections(8)).await?;
//! let repository = SqliteExportJobRepository::new(pool);
//! ```

use crate::{ExportError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for the job database
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// `sqlite:` URL of the database
    pub database_url: String,
    pub max_connections: u32,
    /// How long a caller waits for a free connection
    pub acquire_timeout: Duration,
    /// Close connections idle for longer than this; `None` keeps them
    pub idle_timeout: Option<Duration>,
}

impl DatabaseConfig {
    /// File-backed database; a bare path gets the `sqlite:` scheme prepended
    pub fn new(database_url: impl Into<String>) -> Self {
        let url = database_url.into();
        let database_url = if url.starts_with("sqlite:") {
            url
        } else {
            format!("sqlite:{}", url)
        };

        Self {
            database_url,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Open a pool, apply migrations and verify it answers queries
///
/// # Errors
///
/// `Database` for a bad URL or a failed connection, `Migration` when the
/// schema cannot be applied.
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Opening job database"
    );

    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|e| ExportError::Database(e.to_string()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    // An in-memory database vanishes with its last connection.
    let min_connections = if config.is_in_memory() { 1 } else { 0 };
    let max_lifetime = if config.is_in_memory() {
        None
    } else {
        Some(Duration::from_secs(30 * 60))
    };

    let pool = SqlitePoolOptions::new()
        .min_connections(min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(max_lifetime)
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Could not open job database");
            ExportError::Database(e.to_string())
        })?;

    run_migrations(&pool).await?;
    health_check(&pool).await?;

    info!(connections = pool.size(), "Job database ready");
    Ok(pool)
}

/// In-memory pool with the schema applied
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory()).await
}

/// Apply any migrations not yet recorded in `_sqlx_migrations`
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    debug!("Applying job database migrations");

    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        warn!(error = %e, "Job database migration failed");
        ExportError::Migration(e.to_string())
    })
}

pub async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| {
            warn!(error = %e, "Job database health check failed");
            ExportError::Database(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_test_pool_is_migrated_and_healthy() {
        let pool = create_test_pool().await.unwrap();
        health_check(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'export_jobs'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test]
    async fn test_rerunning_migrations_is_a_no_op() {
        let pool = create_test_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
    }

    #[test]
    fn test_config_urls_and_setters() {
        let config = DatabaseConfig::new("exports.db")
            .max_connections(0)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(None);

        assert_eq!(config.database_url, "sqlite:exports.db");
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, None);

        assert_eq!(
            DatabaseConfig::new("sqlite:/var/lib/exports.db").database_url,
            "sqlite:/var/lib/exports.db"
        );
        assert!(DatabaseConfig::default().is_in_memory());
    }
}
