//! Database connection management
//!
//! Opens the SQLite pool and applies migrations.

use super::error::DbResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Connect with the default pool size.
    ///
    /// `database_url` is an SQLite connection string such as
    /// `sqlite://bigmodel.db` or `sqlite::memory:`. File databases are
    /// created if missing.
    pub async fn new(database_url: &str) -> DbResult<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    /// Connect with a custom pool size.
    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Private in-memory database.
    ///
    /// Every pooled connection to `sqlite::memory:` opens its own database,
    /// so the pool is held to a single connection.
    pub async fn in_memory() -> DbResult<Self> {
        Self::with_max_connections("sqlite::memory:", 1).await
    }

    /// Open the database at `path` and bring its schema up to date.
    pub async fn open(path: &str) -> DbResult<Self> {
        let conn = if path == ":memory:" {
            Self::in_memory().await?
        } else {
            Self::new(&format!("sqlite://{}", path)).await?
        };
        conn.run_migrations().await?;
        Ok(conn)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run migrations on the database
    pub async fn run_migrations(&self) -> DbResult<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Close the connection pool gracefully
    pub async fn close(self) {
        self.pool.close().await;
    }
}
