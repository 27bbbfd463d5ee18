//! PostgreSQL job store
//!
//! This module owns the connection pool and every statement that touches the
//! `jobs` table. Job state transitions are single conditional statements so
//! that concurrent claimers and recovery passes never race each other.
//!
//! - [`jobs`] - job rows, states and the transition statements
//! - [`migrate`] - schema migrations applied once before serving

pub mod jobs;
pub mod migrate;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use std::path::PathBuf;
use thiserror::Error;
use tokio_postgres::config::SslMode;
use tokio_postgres::NoTls;

use crate::config::{DatabaseConfig, DbSslMode};

pub use jobs::{JobRecord, JobState, NewJob};
pub use migrate::{run_migrations, Migration};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the job store
#[derive(Error, Debug)]
pub enum StorageError {
    /// No connection could be checked out of the pool
    #[error("Failed to get a database connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The pool could not be built
    #[error("Failed to build connection pool: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    /// A statement failed
    #[error("Database query failed: {}", describe_postgres_error(.0))]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection settings could not be parsed
    #[error("Invalid connection settings: {0}")]
    Config(String),

    /// A migration file failed to apply
    #[error("Migration {file} failed: {reason}")]
    Migration { file: String, reason: String },

    /// Migration directory could not be read
    #[error("Failed to read migrations from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A row carried a state outside the job state machine
    #[error("Invalid job state '{0}'")]
    InvalidState(String),
}

/// Server errors only display as "db error"; pull out what the server said
fn describe_postgres_error(err: &tokio_postgres::Error) -> String {
    let Some(db) = err.as_db_error() else {
        return err.to_string();
    };

    let mut message = format!("{} {}: {}", db.severity(), db.code().code(), db.message());
    if let Some(detail) = db.detail() {
        message.push_str(&format!(" ({detail})"));
    }
    message
}

impl StorageError {
    /// Check if the error is recoverable
    ///
    /// Connection and statement failures are treated as transient.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Postgres(_))
    }
}

/// Handle to the job database
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
}

impl JobStore {
    /// Build a store from the database configuration
    ///
    /// No connection is opened until the first query.
    pub fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        let pg_config = postgres_config(config)?;
        Self::with_postgres_config(pg_config, config.pool_size)
    }

    /// Build a store from a connection string (URL or key/value form)
    pub fn from_url(url: &str, pool_size: usize) -> StorageResult<Self> {
        let pg_config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Self::with_postgres_config(pg_config, pool_size)
    }

    fn with_postgres_config(
        pg_config: tokio_postgres::Config,
        pool_size: usize,
    ) -> StorageResult<Self> {
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()?;

        Ok(Self { pool })
    }

    /// Check out a connection
    pub async fn client(&self) -> StorageResult<Object> {
        Ok(self.pool.get().await?)
    }

    /// Verify the database is reachable
    pub async fn ping(&self) -> StorageResult<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close the pool; outstanding connections are dropped when returned
    pub fn close(&self) {
        self.pool.close();
    }

    /// Current pool status
    pub fn pool_status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
            max_size: status.max_size,
        }
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("pool", &self.pool_status())
            .finish()
    }
}

/// Connection pool status
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Current pool size
    pub size: usize,

    /// Idle connections
    pub available: usize,

    /// Waiting requests
    pub waiting: usize,

    /// Maximum pool size
    pub max_size: usize,
}

fn postgres_config(config: &DatabaseConfig) -> StorageResult<tokio_postgres::Config> {
    if let Some(url) = &config.url {
        return url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| StorageError::Config(e.to_string()));
    }

    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password)
        .ssl_mode(match config.ssl_mode {
            DbSslMode::Disable => SslMode::Disable,
            DbSslMode::Prefer => SslMode::Prefer,
        });

    Ok(pg_config)
}
