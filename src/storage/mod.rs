pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod trait_def;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{DatabaseBackend, DatabaseConfig};

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;
pub use trait_def::{
    ClickEventStore, GrantTransaction, PermissionStore, ReportStore, Storage, StorageError,
    StorageResult, UserDirectory,
};

/// The collaborator handles the engine and access controller consume.
#[derive(Clone)]
pub struct Stores {
    pub clicks: Arc<dyn ClickEventStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub users: Arc<dyn UserDirectory>,
    pub reports: Arc<dyn ReportStore>,
}

impl Stores {
    pub fn from_backend<S: Storage + 'static>(storage: Arc<S>) -> Self {
        Self {
            clicks: storage.clone(),
            permissions: storage.clone(),
            users: storage.clone(),
            reports: storage,
        }
    }

    /// Open and initialize the configured backend.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let stores = match config.backend {
            DatabaseBackend::Memory => {
                info!("Using in-memory storage");
                let storage = Arc::new(MemoryStorage::new());
                storage.init().await?;
                Self::from_backend(storage)
            }
            DatabaseBackend::Sqlite => {
                info!("Using SQLite storage: {}", config.url);
                let storage =
                    Arc::new(SqliteStorage::new(&config.url, config.max_connections).await?);
                storage.init().await?;
                Self::from_backend(storage)
            }
            DatabaseBackend::Postgres => {
                info!("Using PostgreSQL storage: {}", config.url);
                let storage =
                    Arc::new(PostgresStorage::new(&config.url, config.max_connections).await?);
                storage.init().await?;
                Self::from_backend(storage)
            }
        };
        Ok(stores)
    }
}

pub(crate) fn from_unix(secs: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Other(anyhow!("timestamp {secs} out of range")))
}

pub(crate) fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Unique-key violations surface as [`StorageError::Conflict`].
pub(crate) fn db_err(err: sqlx::Error) -> StorageError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StorageError::Conflict,
        _ => StorageError::Other(err.into()),
    }
}
