use async_trait::async_trait;
use coldchain_parser::{parser_for, ParsedBatch, SourceFormat};
use tracing::debug;

use super::{conclude, source_url, Collection, Collector, CollectorError, HttpSource};
use crate::config::CollectorConfig;
use crate::types::{IngestionLogEntry, SharingMethod, TenantSource};

/// Polls a tenant endpoint serving `{"readings": [...]}`. One GET per call,
/// no retry inside the call; the next tick is the retry.
pub struct PushApiCollector {
    http: HttpSource,
}

impl PushApiCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        Ok(Self {
            http: HttpSource::new(config)?,
        })
    }

    async fn try_fetch(&self, tenant: &TenantSource) -> Result<ParsedBatch, CollectorError> {
        let url = source_url(tenant)?;
        debug!(tenant = %tenant.code, url, "polling readings endpoint");
        let body = self.http.get(url).await?;
        let parser = parser_for(SourceFormat::PushApiJson);
        debug!(tenant = %tenant.code, parser = parser.name(), bytes = body.len(), "parsing response");
        Ok(parser.parse(&body)?)
    }
}

#[async_trait]
impl Collector for PushApiCollector {
    fn method(&self) -> SharingMethod {
        SharingMethod::PushApi
    }

    async fn fetch(&self, tenant: &TenantSource, log: IngestionLogEntry) -> Collection {
        let outcome = self.try_fetch(tenant).await;
        conclude(tenant, log, outcome)
    }
}
