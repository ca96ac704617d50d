use std::path::PathBuf;

use thiserror::Error;

use crate::collectors::CollectorError;
use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to connect to Postgres: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create directory '{}': {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("job exceeded {seconds}s timeout")]
    JobTimeout { seconds: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
