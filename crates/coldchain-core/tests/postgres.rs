use std::env;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use coldchain_core::config::{DatabaseConfig, WriterConfig};
use coldchain_core::db;
use coldchain_core::queue::{EventQueue, PostgresQueue, Topology};
use coldchain_core::registry::{PostgresRegistry, TenantRegistry};
use coldchain_core::store::{IngestionLogStore, PostgresLogStore, PostgresReadingStore, ReadingStore};
use coldchain_core::types::{CanonicalEvent, IngestionLogEntry, IngestionStatus, SharingMethod, TemperatureReading};
use coldchain_core::writer::{BatchWriter, DeadLetterSink};
use coldchain_parser::RawRecord;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use uuid::Uuid;

const REGISTRY_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id UUID PRIMARY KEY,
    customer_code TEXT NOT NULL UNIQUE,
    data_sharing_method TEXT NOT NULL,
    data_frequency_seconds INTEGER NOT NULL,
    api_url TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS facilities (
    id UUID PRIMARY KEY,
    customer_id UUID NOT NULL REFERENCES customers(id),
    facility_code TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS storage_units (
    id UUID PRIMARY KEY,
    facility_id UUID NOT NULL REFERENCES facilities(id),
    unit_code TEXT NOT NULL
);
"#;

/// Every test truncates the same tables.
static DB_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn database_url(test: &str) -> Option<String> {
    match env::var("COLDCHAIN_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping {test} because COLDCHAIN_TEST_DATABASE_URL is not set");
            None
        }
    }
}

async fn prepare(url: &str) -> Result<db::DbPool> {
    let pool = db::connect(url, &DatabaseConfig::default()).await?;
    db::run_migrations(&pool).await?;
    sqlx::raw_sql(REGISTRY_TABLES).execute(&pool).await?;
    sqlx::query(
        "TRUNCATE TABLE temperature_readings, ingestion_logs, event_queue, storage_units, facilities, customers CASCADE",
    )
    .execute(&pool)
    .await?;
    Ok(pool)
}

fn event(temperature: &str) -> CanonicalEvent {
    CanonicalEvent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        RawRecord::from_pairs([
            ("facility_id", "FAC-01"),
            ("unit_id", "UNIT-A"),
            ("temperature", temperature),
            ("timestamp", "2025-03-01T10:00:00Z"),
            ("quality_score", "0.2"),
            ("equipment_status", "warning"),
        ]),
    )
}

#[test]
fn readings_and_logs_round_trip_through_postgres() -> Result<()> {
    let Some(url) = database_url("readings_and_logs_round_trip_through_postgres") else {
        return Ok(());
    };
    let _serial = serial();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = prepare(&url).await?;
        let store = PostgresReadingStore::new(pool.clone());

        let readings: Vec<TemperatureReading> = ["-18.5", "4.0", ""]
            .into_iter()
            .map(|t| TemperatureReading::from_event(&event(t)))
            .collect::<Result<_, _>>()?;
        assert_eq!(store.insert_batch(&readings).await?, 3);
        assert_eq!(store.insert_batch(&[]).await?, 0);
        // Replaying the same readings leaves the table unchanged.
        assert_eq!(store.insert_batch(&readings[..2]).await?, 0);

        let (count, nulls, low_quality): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE temperature IS NULL), COUNT(*) FILTER (WHERE quality_score = 0) FROM temperature_readings",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!((count, nulls, low_quality), (3, 1, 3));

        let logs = PostgresLogStore::new(pool.clone());
        let tenant = coldchain_core::types::TenantSource {
            id: Uuid::new_v4(),
            code: "A".into(),
            sharing_method: SharingMethod::PullCsv,
            source_url: Some("http://example.invalid/a.csv".into()),
            polling_interval_seconds: 300,
            active: true,
        };
        let pending = IngestionLogEntry::pending(&tenant);
        logs.insert(&pending).await?;
        logs.finalize(&pending.clone().complete(2, 1)).await?;

        let recent = logs.recent(Some(tenant.id), 10).await?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, IngestionStatus::Warning);
        assert_eq!(recent[0].records_failed, 1);
        assert!(recent[0].end_time.is_some());
        assert_eq!(logs.recent(None, 10).await?.len(), 1);

        let missing = IngestionLogEntry::pending(&tenant).fail("never inserted");
        assert!(logs.finalize(&missing).await.is_err());

        pool.close().await;
        Ok(())
    })
}

#[test]
fn postgres_queue_redelivers_until_acked() -> Result<()> {
    let Some(url) = database_url("postgres_queue_redelivers_until_acked") else {
        return Ok(());
    };
    let _serial = serial();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = prepare(&url).await?;
        let queue = PostgresQueue::new(pool.clone(), Topology::default(), Duration::from_secs(1));
        queue.ping().await?;

        let first = event("1.0");
        let second = event("2.0");
        queue.publish(&first).await?;
        queue.publish(&second).await?;
        assert_eq!(queue.depth().await?, 2);

        let deliveries = queue.receive(10, Duration::from_millis(100)).await?;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].event()?.event_id, first.event_id);
        assert!(!deliveries[0].redelivered);

        // Leased rows are invisible until nacked or the lease runs out.
        assert!(queue.receive(10, Duration::from_millis(100)).await?.is_empty());
        queue.nack(&[deliveries[1].tag]).await?;
        let again = queue.receive(10, Duration::from_millis(100)).await?;
        assert_eq!(again.len(), 1);
        assert!(again[0].redelivered);
        assert_eq!(again[0].event()?.event_id, second.event_id);

        queue.ack(&[deliveries[0].tag]).await?;
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let expired = queue.receive(10, Duration::from_millis(100)).await?;
        assert_eq!(expired.len(), 1);
        queue.ack(&[expired[0].tag]).await?;
        assert_eq!(queue.depth().await?, 0);

        pool.close().await;
        Ok(())
    })
}

#[test]
fn writer_holding_past_the_lease_writes_each_event_once() -> Result<()> {
    let Some(url) = database_url("writer_holding_past_the_lease_writes_each_event_once") else {
        return Ok(());
    };
    let _serial = serial();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = prepare(&url).await?;
        let dir = TempDir::new()?;
        // The partial batch sits in the writer well past the 1s lease, so the
        // queue hands the same deliveries back while they are still pending.
        let queue = Arc::new(PostgresQueue::new(pool.clone(), Topology::default(), Duration::from_secs(1)));
        let config = WriterConfig {
            batch_size: 10,
            batch_timeout_secs: 4,
            tick_ms: 100,
            max_pending: 100,
            receive_wait_ms: 100,
            dead_letter_dir: dir.path().to_path_buf(),
            ..WriterConfig::default()
        };
        let writer = BatchWriter::new(
            queue.clone(),
            Arc::new(PostgresReadingStore::new(pool.clone())),
            DeadLetterSink::new(dir.path()),
            config,
        )
        .spawn();

        let events = [event("-18.0"), event("-19.0")];
        for event in &events {
            queue.publish(event).await?;
        }
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stats = writer.stop().await;

        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM temperature_readings ORDER BY temperature DESC")
            .fetch_all(&pool)
            .await?;
        assert_eq!(ids, vec![events[0].event_id, events[1].event_id]);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(queue.depth().await?, 0);

        pool.close().await;
        Ok(())
    })
}

#[test]
fn registry_reads_tenants_and_mappings() -> Result<()> {
    let Some(url) = database_url("registry_reads_tenants_and_mappings") else {
        return Ok(());
    };
    let _serial = serial();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = prepare(&url).await?;
        let (active, inactive, facility, unit) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        sqlx::query(
            "INSERT INTO customers (id, customer_code, data_sharing_method, data_frequency_seconds, api_url, is_active) VALUES ($1, 'A', 'csv', 300, 'http://a/export.csv', TRUE), ($2, 'Z', 'ftp', 60, NULL, FALSE)",
        )
        .bind(active)
        .bind(inactive)
        .execute(&pool)
        .await?;
        sqlx::query("INSERT INTO facilities (id, customer_id, facility_code) VALUES ($1, $2, 'FAC-01')")
            .bind(facility)
            .bind(active)
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO storage_units (id, facility_id, unit_code) VALUES ($1, $2, 'UNIT-A')")
            .bind(unit)
            .bind(facility)
            .execute(&pool)
            .await?;

        let registry = PostgresRegistry::new(pool.clone());
        let tenants = registry.active_tenants().await?;
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].sharing_method, SharingMethod::PullCsv);
        assert_eq!(tenants[0].polling_interval_seconds, 300);

        let z = registry.tenant_by_code("Z").await?.expect("inactive tenant is still found");
        assert!(!z.active);
        assert_eq!(z.sharing_method, SharingMethod::Unsupported("ftp".into()));

        assert_eq!(registry.facilities(active).await?[0].id, facility);
        assert_eq!(registry.units(active).await?[0].id, unit);
        assert!(registry.units(inactive).await?.is_empty());

        pool.close().await;
        Ok(())
    })
}
