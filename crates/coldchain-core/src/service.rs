//! Builds the pipeline from a `Config` and owns its lifecycle.

use std::sync::Arc;

use tracing::{info, warn};

use crate::collectors::CollectorSet;
use crate::config::{Config, QueueBackend, RegistryBackend};
use crate::db::{self, DbPool};
use crate::error::{IngestError, Result};
use crate::identifiers::IdentifierCacheSet;
use crate::job::IngestionJob;
use crate::processor::Processor;
use crate::queue::{EventQueue, MemoryQueue, PostgresQueue, Topology};
use crate::registry::{PostgresRegistry, StaticRegistry, TenantRegistry};
use crate::resilience::Backoff;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::store::{IngestionLogStore, PostgresLogStore, PostgresReadingStore, ReadingStore};
use crate::types::IngestionLogEntry;
use crate::writer::{BatchWriter, DeadLetterSink, WriterHandle, WriterStats};

/// External resources the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub pool: Option<DbPool>,
    pub registry: Arc<dyn TenantRegistry>,
    pub queue: Arc<dyn EventQueue>,
    pub readings: Arc<dyn ReadingStore>,
    pub logs: Arc<dyn IngestionLogStore>,
}

impl Backends {
    /// Connects to Postgres and picks the registry and queue backends named
    /// in the config. Readings and ingestion logs always live in Postgres.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let url = config.database_url()?;
        let pool = db::connect(url, &config.database).await?;

        let registry: Arc<dyn TenantRegistry> = match config.registry.backend {
            RegistryBackend::Postgres => Arc::new(PostgresRegistry::new(pool.clone())),
            RegistryBackend::Static => {
                let Some(path) = config.registry.path.as_deref() else {
                    return Err(IngestError::Validation(
                        "registry.path is required for the static registry".into(),
                    ));
                };
                Arc::new(StaticRegistry::from_path(path)?)
            }
        };

        let topology = Topology::from_config(&config.queue);
        let queue: Arc<dyn EventQueue> = match config.queue.backend {
            QueueBackend::Postgres => Arc::new(PostgresQueue::new(
                pool.clone(),
                topology,
                config.queue.visibility_timeout(),
            )),
            QueueBackend::Memory => {
                warn!("in-memory queue selected; unwritten readings are lost on exit");
                Arc::new(MemoryQueue::new(topology, config.queue.capacity))
            }
        };

        Ok(Self {
            readings: Arc::new(PostgresReadingStore::new(pool.clone())),
            logs: Arc::new(PostgresLogStore::new(pool.clone())),
            pool: Some(pool),
            registry,
            queue,
        })
    }

    /// Pings the database and the queue and counts active tenants.
    pub async fn check(&self) -> Result<usize> {
        if let Some(pool) = &self.pool {
            db::ping(pool).await?;
        }
        self.queue.ping().await?;
        Ok(self.registry.active_tenants().await?.len())
    }
}

/// Everything needed to run one tenant's collection, minus the scheduler.
pub fn build_job(config: &Config, backends: &Backends) -> Result<Arc<IngestionJob>> {
    let collectors = CollectorSet::from_config(&config.collector)?;
    let processor = Arc::new(Processor::new(
        Arc::clone(&backends.registry),
        Arc::clone(&backends.queue),
        Arc::new(IdentifierCacheSet::new()),
        Backoff::for_publish(&config.queue),
    ));
    Ok(Arc::new(IngestionJob::new(
        collectors,
        processor,
        Arc::clone(&backends.logs),
        config.scheduler.job_timeout(),
    )))
}

async fn prepare_dirs(config: &Config) -> Result<()> {
    for dir in [&config.collector.download_dir, &config.writer.dead_letter_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| IngestError::Directory {
                path: dir.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Runs a single collection for the tenant with `code`, outside the schedule.
pub async fn collect_once(config: &Config, backends: &Backends, code: &str) -> Result<IngestionLogEntry> {
    let Some(tenant) = backends.registry.tenant_by_code(code).await? else {
        return Err(IngestError::Validation(format!("no tenant with code '{code}'")));
    };
    if !tenant.active {
        warn!(tenant = %tenant.code, "tenant is inactive, collecting anyway");
    }
    prepare_dirs(config).await?;
    let job = build_job(config, backends)?;
    Ok(job.run(&tenant).await)
}

/// The running pipeline: scheduler on the producing side, writer on the
/// consuming side, with the queue in between.
pub struct IngestionService {
    scheduler: SchedulerHandle,
    writer: WriterHandle,
    queue: Arc<dyn EventQueue>,
    pool: Option<DbPool>,
}

impl IngestionService {
    /// Starts the writer first so the queue has a consumer before the first
    /// job publishes.
    pub async fn start(config: &Config, backends: Backends) -> Result<Self> {
        prepare_dirs(config).await?;
        let job = build_job(config, &backends)?;

        let writer = BatchWriter::new(
            Arc::clone(&backends.queue),
            Arc::clone(&backends.readings),
            DeadLetterSink::new(&config.writer.dead_letter_dir),
            config.writer.clone(),
        )
        .spawn();

        let scheduler = match Scheduler::new(Arc::clone(&backends.registry), job, config.scheduler.clone())
            .start()
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                writer.stop().await;
                return Err(err.into());
            }
        };

        info!(
            queue = %backends.queue.topology().queue_name,
            exchange = %backends.queue.topology().exchange,
            "ingestion service started"
        );
        Ok(Self {
            scheduler,
            writer,
            queue: backends.queue,
            pool: backends.pool,
        })
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Stops timers and waits for running jobs, then lets the writer flush
    /// before the queue and the pool are closed.
    pub async fn shutdown(self) -> WriterStats {
        info!("shutting down ingestion service");
        self.scheduler.stop().await;
        let stats = self.writer.stop().await;
        self.queue.close().await;
        if let Some(pool) = self.pool {
            pool.close().await;
        }
        info!("ingestion service stopped");
        stats
    }
}
