use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{IngestionLogStore, ReadingStore, StoreError};
use crate::types::{IngestionLogEntry, IngestionStatus, TemperatureReading, TenantId};

#[derive(Clone)]
pub struct PostgresReadingStore {
    pool: PgPool,
}

impl PostgresReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadingStore for PostgresReadingStore {
    async fn insert_batch(&self, readings: &[TemperatureReading]) -> Result<u64, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO temperature_readings (id, tenant_id, facility_id, unit_id, temperature, \
             temperature_unit, recorded_at, sensor_id, quality_score, equipment_status) ",
        );
        builder.push_values(readings, |mut row, reading| {
            row.push_bind(reading.id)
                .push_bind(reading.tenant_id)
                .push_bind(reading.facility_id)
                .push_bind(reading.unit_id)
                .push_bind(reading.temperature)
                .push_bind(reading.temperature_unit.as_str())
                .push_bind(reading.recorded_at)
                .push_bind(&reading.sensor_id)
                .push_bind(reading.quality_score)
                .push_bind(reading.equipment_status.as_str());
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn log_from_row(row: PgRow) -> Result<IngestionLogEntry, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = IngestionStatus::parse(&status_str)
        .ok_or_else(|| StoreError::InvalidStatus(status_str.clone()))?;

    Ok(IngestionLogEntry {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        method: row.try_get("method")?,
        status,
        records_processed: row.try_get("records_processed")?,
        records_succeeded: row.try_get("records_succeeded")?,
        records_failed: row.try_get("records_failed")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        error_message: row.try_get("error_message")?,
        source_url: row.try_get("source_url")?,
    })
}

#[async_trait]
impl IngestionLogStore for PostgresLogStore {
    async fn insert(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_logs (
                id,
                tenant_id,
                method,
                status,
                records_processed,
                records_succeeded,
                records_failed,
                start_time,
                end_time,
                error_message,
                source_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(&entry.method)
        .bind(entry.status.as_str())
        .bind(entry.records_processed)
        .bind(entry.records_succeeded)
        .bind(entry.records_failed)
        .bind(entry.start_time)
        .bind(entry.end_time)
        .bind(&entry.error_message)
        .bind(&entry.source_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_logs
            SET status = $1,
                records_processed = $2,
                records_succeeded = $3,
                records_failed = $4,
                end_time = $5,
                error_message = $6
            WHERE id = $7
            "#,
        )
        .bind(entry.status.as_str())
        .bind(entry.records_processed)
        .bind(entry.records_succeeded)
        .bind(entry.records_failed)
        .bind(entry.end_time)
        .bind(&entry.error_message)
        .bind(entry.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(entry.id));
        }

        Ok(())
    }

    async fn recent(
        &self,
        tenant_id: Option<TenantId>,
        limit: i64,
    ) -> Result<Vec<IngestionLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                tenant_id,
                method,
                status,
                records_processed,
                records_succeeded,
                records_failed,
                start_time,
                end_time,
                error_message,
                source_url
            FROM ingestion_logs
            WHERE $1::uuid IS NULL OR tenant_id = $1
            ORDER BY start_time DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }
}
