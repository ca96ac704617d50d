mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coldchain_core::collectors::{Collection, Collector, CollectorSet};
use coldchain_core::identifiers::IdentifierCacheSet;
use coldchain_core::job::IngestionJob;
use coldchain_core::processor::Processor;
use coldchain_core::queue::{MemoryQueue, Topology};
use coldchain_core::resilience::Backoff;
use coldchain_core::store::MemoryLogStore;
use coldchain_core::types::{IngestionLogEntry, IngestionStatus, SharingMethod, TenantSource};
use coldchain_parser::RawRecord;
use common::{map_tenant, tenant};

/// Collector that hands back `count` mapped readings straight away.
struct FixedCollector {
    count: usize,
}

#[async_trait]
impl Collector for FixedCollector {
    fn method(&self) -> SharingMethod {
        SharingMethod::PullCsv
    }

    async fn fetch(&self, _tenant: &TenantSource, log: IngestionLogEntry) -> Collection {
        let records = (0..self.count)
            .map(|i| {
                RawRecord::from_pairs([
                    ("facility_id", "FAC-01".to_string()),
                    ("unit_id", "UNIT-A".to_string()),
                    ("temperature", format!("-18.{i}")),
                    ("timestamp", "2025-03-01T10:00:00Z".to_string()),
                ])
            })
            .collect();
        Collection {
            records,
            log: log.complete(self.count, 0),
        }
    }
}

fn job(
    tenant: &TenantSource,
    records: usize,
    queue: Arc<MemoryQueue>,
    logs: Arc<MemoryLogStore>,
    timeout: Duration,
) -> IngestionJob {
    let registry = common::empty_registry();
    map_tenant(&registry, tenant, &[("FAC-01", &["UNIT-A"])]);
    let collector = Arc::new(FixedCollector { count: records });
    let processor = Arc::new(Processor::new(
        registry,
        queue,
        Arc::new(IdentifierCacheSet::new()),
        Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 1),
    ));
    IngestionJob::new(CollectorSet::new(collector.clone(), collector), processor, logs, timeout)
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_keeps_collected_counts() {
    let a = tenant("A", SharingMethod::PullCsv, None, 300);
    // Room for one event: the second publish waits until the deadline.
    let queue = Arc::new(MemoryQueue::new(Topology::default(), 1));
    let logs = Arc::new(MemoryLogStore::new());
    let job = job(&a, 3, queue.clone(), logs.clone(), Duration::from_secs(5));

    let log = job.run(&a).await;

    assert_eq!(log.status, IngestionStatus::Failure);
    assert_eq!(log.error_message.as_deref(), Some("job exceeded 5s timeout"));
    assert_eq!(log.records_processed, 3);
    assert_eq!(log.records_succeeded, 3);
    assert_eq!(queue.ready_len(), 1);

    let stored = logs.for_tenant(a.id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].records_succeeded, 3);
    assert_eq!(stored[0].status, IngestionStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn final_entry_is_inserted_when_the_start_was_not_recorded() {
    let a = tenant("A", SharingMethod::PullCsv, None, 300);
    let queue = Arc::new(MemoryQueue::new(Topology::default(), 100));
    let logs = Arc::new(MemoryLogStore::new());
    logs.fail_next_insert(1, "connection reset");
    let job = job(&a, 2, queue.clone(), logs.clone(), Duration::from_secs(30));

    let log = job.run(&a).await;

    assert_eq!(log.status, IngestionStatus::Success);
    let stored = logs.for_tenant(a.id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, log.id);
    assert!(stored[0].is_finalized());
    assert_eq!(stored[0].records_succeeded, 2);
    assert_eq!(queue.ready_len(), 2);
}
