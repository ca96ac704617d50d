//! Persistence seams for the two tables this pipeline writes.

mod memory;
mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{IngestionLogEntry, TemperatureReading, TenantId};

pub use memory::{MemoryLogStore, MemoryReadingStore};
pub use postgres::{PostgresLogStore, PostgresReadingStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid status value '{0}'")]
    InvalidStatus(String),

    #[error("ingestion log '{0}' not found")]
    NotFound(uuid::Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Inserts every reading in one statement; nothing is written on error.
    /// Readings whose id is already stored are skipped. Returns the number of
    /// rows inserted.
    async fn insert_batch(&self, readings: &[TemperatureReading]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait IngestionLogStore: Send + Sync {
    async fn insert(&self, entry: &IngestionLogEntry) -> Result<(), StoreError>;

    /// Writes the final status, counters and end time of an entry.
    async fn finalize(&self, entry: &IngestionLogEntry) -> Result<(), StoreError>;

    /// Most recent entries first.
    async fn recent(
        &self,
        tenant_id: Option<TenantId>,
        limit: i64,
    ) -> Result<Vec<IngestionLogEntry>, StoreError>;
}
