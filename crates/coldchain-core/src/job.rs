//! One collection attempt for one tenant: collect, publish, record the outcome.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::collectors::CollectorSet;
use crate::error::IngestError;
use crate::processor::Processor;
use crate::store::{IngestionLogStore, StoreError};
use crate::types::{IngestionLogEntry, IngestionStatus, TenantSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct IngestionJob {
    collectors: CollectorSet,
    processor: Arc<Processor>,
    logs: Arc<dyn IngestionLogStore>,
    timeout: Duration,
}

impl IngestionJob {
    pub fn new(
        collectors: CollectorSet,
        processor: Arc<Processor>,
        logs: Arc<dyn IngestionLogStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            collectors,
            processor,
            logs,
            timeout,
        }
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    /// Runs the attempt to completion and returns the finalized log entry.
    /// Every failure mode ends up in that entry rather than in an error.
    pub async fn run(&self, tenant: &TenantSource) -> IngestionLogEntry {
        let pending = IngestionLogEntry::pending(tenant);
        if let Err(err) = self.logs.insert(&pending).await {
            error!(tenant = %tenant.code, error = %err, "failed to record ingestion start");
        }

        // Latest state of the attempt; a timed-out job keeps what it had collected.
        let progress = Mutex::new(pending);
        let finished = match tokio::time::timeout(self.timeout, self.collect_and_publish(tenant, &progress)).await {
            Ok(entry) => entry,
            Err(_) => {
                let err = IngestError::JobTimeout {
                    seconds: self.timeout.as_secs(),
                };
                warn!(tenant = %tenant.code, timeout_secs = self.timeout.as_secs(), "ingestion job timed out");
                lock(&progress).clone().fail(err.to_string())
            }
        };

        self.record(tenant, &finished).await;
        finished
    }

    /// Finalizes the entry, inserting it when the pending row never made it in.
    async fn record(&self, tenant: &TenantSource, finished: &IngestionLogEntry) {
        let result = match self.logs.finalize(finished).await {
            Err(StoreError::NotFound(_)) => {
                warn!(tenant = %tenant.code, log_id = %finished.id, "no pending ingestion log, inserting final entry");
                self.logs.insert(finished).await
            }
            other => other,
        };
        if let Err(err) = result {
            error!(tenant = %tenant.code, error = %err, "failed to finalize ingestion log");
        }
    }

    async fn collect_and_publish(&self, tenant: &TenantSource, progress: &Mutex<IngestionLogEntry>) -> IngestionLogEntry {
        let log = lock(progress).clone();
        let Some(collector) = self.collectors.for_method(&tenant.sharing_method) else {
            return log.fail(format!(
                "unsupported sharing method '{}'",
                tenant.sharing_method
            ));
        };

        debug!(tenant = %tenant.code, method = %collector.method(), "running collector");
        let collection = collector.fetch(tenant, log).await;
        *lock(progress) = collection.log.clone();
        if collection.log.status == IngestionStatus::Failure {
            return collection.log;
        }

        match self.processor.process(tenant, collection.records).await {
            Ok(summary) => {
                info!(
                    tenant = %tenant.code,
                    published = summary.published,
                    unmapped = summary.unmapped,
                    status = %collection.log.status,
                    "ingestion job finished"
                );
                collection.log
            }
            Err(err) => {
                error!(tenant = %tenant.code, error = %err, "publishing collected records failed");
                collection.log.fail(err.to_string())
            }
        }
    }
}
