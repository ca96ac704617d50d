//! Maps collected records onto internal identifiers and publishes them.

use std::sync::Arc;

use coldchain_parser::RawRecord;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identifiers::IdentifierCacheSet;
use crate::queue::{EventQueue, QueueError};
use crate::registry::{RegistryError, TenantRegistry};
use crate::resilience::{retry_with_backoff, Backoff, RetryError};
use crate::types::{CanonicalEvent, TenantId, TenantSource};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to load identifier mappings: {0}")]
    Mappings(#[from] RegistryError),

    #[error("publish failed after {published} events: {source}")]
    Publish {
        published: usize,
        #[source]
        source: RetryError<QueueError>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub published: usize,
    /// Records with no matching facility or unit.
    pub unmapped: usize,
}

pub struct Processor {
    registry: Arc<dyn TenantRegistry>,
    queue: Arc<dyn EventQueue>,
    caches: Arc<IdentifierCacheSet>,
    backoff: Backoff,
}

impl Processor {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        queue: Arc<dyn EventQueue>,
        caches: Arc<IdentifierCacheSet>,
        backoff: Backoff,
    ) -> Self {
        Self {
            registry,
            queue,
            caches,
            backoff,
        }
    }

    pub fn caches(&self) -> &Arc<IdentifierCacheSet> {
        &self.caches
    }

    /// Drops a tenant's mappings so the next batch reloads them.
    pub fn invalidate(&self, tenant_id: TenantId) {
        self.caches.invalidate(tenant_id);
    }

    /// Publishes one event per mappable record, in input order.
    pub async fn process(
        &self,
        tenant: &TenantSource,
        records: Vec<RawRecord>,
    ) -> Result<ProcessSummary, ProcessError> {
        let mut summary = ProcessSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let cache = self
            .caches
            .get_or_load(tenant.id, self.registry.as_ref())
            .await?;

        for record in records {
            let Some(facility_code) = record.facility_code() else {
                warn!(tenant = %tenant.code, "record has no facility code, dropping");
                summary.unmapped += 1;
                continue;
            };
            let Some(facility_id) = cache.facility_id(&facility_code) else {
                warn!(tenant = %tenant.code, facility = %facility_code, "unknown facility code, dropping record");
                summary.unmapped += 1;
                continue;
            };
            let Some(unit_code) = record.unit_code() else {
                warn!(tenant = %tenant.code, facility = %facility_code, "record has no unit code, dropping");
                summary.unmapped += 1;
                continue;
            };
            let Some(unit_id) = cache.unit_id(facility_id, &unit_code) else {
                warn!(
                    tenant = %tenant.code,
                    facility = %facility_code,
                    unit = %unit_code,
                    "unknown unit code, dropping record"
                );
                summary.unmapped += 1;
                continue;
            };

            let event = CanonicalEvent::new(tenant.id, facility_id, unit_id, record);
            let queue = &self.queue;
            retry_with_backoff(&self.backoff, "publish", QueueError::is_transient, || {
                queue.publish(&event)
            })
            .await
            .map_err(|source| ProcessError::Publish {
                published: summary.published,
                source,
            })?;
            summary.published += 1;
        }

        debug!(
            tenant = %tenant.code,
            published = summary.published,
            unmapped = summary.unmapped,
            "processed batch"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::queue::{MemoryQueue, Topology};
    use crate::registry::StaticRegistry;
    use crate::types::{FacilityRecord, SharingMethod, UnitRecord};

    struct Fixture {
        tenant: TenantSource,
        queue: Arc<MemoryQueue>,
        processor: Processor,
        unit: Uuid,
    }

    fn fixture() -> Fixture {
        let tenant = TenantSource {
            id: Uuid::new_v4(),
            code: "A".into(),
            sharing_method: SharingMethod::PullCsv,
            source_url: None,
            polling_interval_seconds: 300,
            active: true,
        };
        let facility = Uuid::new_v4();
        let unit = Uuid::new_v4();
        let registry = Arc::new(StaticRegistry::new(
            vec![tenant.clone()],
            vec![FacilityRecord {
                id: facility,
                tenant_id: tenant.id,
                facility_code: "FAC-01".into(),
            }],
            vec![UnitRecord {
                id: unit,
                facility_id: facility,
                unit_code: "UNIT-A".into(),
            }],
        ));
        let queue = Arc::new(MemoryQueue::new(Topology::default(), 100));
        let processor = Processor::new(
            registry,
            queue.clone(),
            Arc::new(IdentifierCacheSet::new()),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2),
        );
        Fixture {
            tenant,
            queue,
            processor,
            unit,
        }
    }

    fn record(facility: &str, unit: &str, temperature: &str) -> RawRecord {
        RawRecord::from_pairs([
            ("facility_id", facility),
            ("unit_id", unit),
            ("temperature", temperature),
            ("timestamp", "2025-03-01T10:00:00Z"),
        ])
    }

    #[tokio::test]
    async fn publishes_mapped_records_in_order_and_drops_unknown_codes() {
        let f = fixture();
        let records = vec![
            record("FAC-01", "UNIT-A", "1.0"),
            record("FAC-99", "UNIT-A", "2.0"),
            record("FAC-01", "UNIT-Z", "3.0"),
            record("FAC-01", "UNIT-A", "4.0"),
        ];

        let summary = f.processor.process(&f.tenant, records).await.unwrap();
        assert_eq!(summary, ProcessSummary { published: 2, unmapped: 2 });

        let deliveries = f.queue.receive(10, Duration::from_millis(10)).await.unwrap();
        let temps: Vec<String> = deliveries
            .iter()
            .map(|d| d.event().unwrap().payload.text(&["temperature"]).unwrap())
            .collect();
        assert_eq!(temps, vec!["1.0", "4.0"]);

        let event = deliveries[0].event().unwrap();
        assert_eq!(event.unit_id, f.unit);
        assert!(event.routing_key.starts_with(&format!("reading.{}.", f.tenant.id)));
    }

    #[tokio::test]
    async fn empty_batches_skip_registry() {
        let f = fixture();
        let summary = f.processor.process(&f.tenant, Vec::new()).await.unwrap();
        assert_eq!(summary.published, 0);
        assert!(f.processor.caches().is_empty());
    }

    #[tokio::test]
    async fn closed_queue_fails_the_batch() {
        let f = fixture();
        f.queue.close().await;
        let err = f
            .processor
            .process(&f.tenant, vec![record("FAC-01", "UNIT-A", "1.0")])
            .await
            .expect_err("queue closed");
        assert!(matches!(err, ProcessError::Publish { published: 0, .. }));
    }
}
