//! Collectors fetch one tenant's raw readings.
//!
//! A collector never returns an error: network, status, decode and audit
//! failures are written into the ingestion log it hands back, together with
//! whatever records it managed to accept.

mod pull_csv;
mod push_api;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coldchain_parser::{ParsedBatch, ParserError, RawRecord};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CollectorConfig;
use crate::types::{IngestionLogEntry, SharingMethod, TenantSource};

pub use pull_csv::PullCsvCollector;
pub use push_api::PushApiCollector;

const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to initialize HTTP client: {0}")]
    Init(String),

    #[error("no source URL configured for tenant '{0}'")]
    MissingSourceUrl(String),

    #[error("request to {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Parse(#[from] ParserError),

    #[error("failed to write audit copy '{path}': {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse task failed: {0}")]
    Task(String),
}

/// Records a collector accepted, plus the finalized log entry for the attempt.
#[derive(Debug, Clone)]
pub struct Collection {
    pub records: Vec<RawRecord>,
    pub log: IngestionLogEntry,
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn method(&self) -> SharingMethod;

    async fn fetch(&self, tenant: &TenantSource, log: IngestionLogEntry) -> Collection;
}

/// Shared HTTP client with an explicit per-request timeout.
#[derive(Clone)]
pub(crate) struct HttpSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSource {
    pub(crate) fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()
            .map_err(|e| CollectorError::Init(e.to_string()))?;
        Ok(Self {
            client,
            timeout: config.timeout(),
        })
    }

    pub(crate) async fn get(&self, url: &str) -> Result<Vec<u8>, CollectorError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.classify(url, err))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::Status {
                status: status.as_u16(),
                body: snippet(&body),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.classify(url, err))?;
        Ok(body.to_vec())
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> CollectorError {
        if err.is_timeout() {
            CollectorError::Timeout {
                url: url.to_string(),
                seconds: self.timeout.as_secs(),
            }
        } else {
            CollectorError::Http(err)
        }
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

pub(crate) fn source_url(tenant: &TenantSource) -> Result<&str, CollectorError> {
    tenant
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| CollectorError::MissingSourceUrl(tenant.code.clone()))
}

/// Turns a fetch outcome into a finalized collection.
pub(crate) fn conclude(
    tenant: &TenantSource,
    log: IngestionLogEntry,
    outcome: Result<ParsedBatch, CollectorError>,
) -> Collection {
    match outcome {
        Ok(batch) => {
            let accepted = batch.records.len();
            let rejected = batch.rejected.len();
            for record in &batch.rejected {
                warn!(tenant = %tenant.code, index = record.index, reason = %record.message, "skipping malformed record");
            }

            let mut log = log.complete(accepted, rejected);
            if let Some(first) = batch.rejected.first() {
                log.error_message = Some(format!("{rejected} malformed records; first: {first}"));
            } else if accepted == 0 {
                log.error_message = Some("source returned no readings".to_string());
            }

            info!(
                tenant = %tenant.code,
                method = %tenant.sharing_method,
                accepted,
                rejected,
                status = %log.status,
                "collection finished"
            );
            Collection {
                records: batch.records,
                log,
            }
        }
        Err(err) => {
            error!(tenant = %tenant.code, method = %tenant.sharing_method, error = %err, "collection failed");
            Collection {
                records: Vec::new(),
                log: log.fail(err.to_string()),
            }
        }
    }
}

/// The collector for each supported sharing method.
#[derive(Clone)]
pub struct CollectorSet {
    push_api: Arc<dyn Collector>,
    pull_csv: Arc<dyn Collector>,
}

impl CollectorSet {
    pub fn new(push_api: Arc<dyn Collector>, pull_csv: Arc<dyn Collector>) -> Self {
        Self { push_api, pull_csv }
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self, CollectorError> {
        Ok(Self::new(
            Arc::new(PushApiCollector::new(config)?),
            Arc::new(PullCsvCollector::new(config)?),
        ))
    }

    pub fn for_method(&self, method: &SharingMethod) -> Option<Arc<dyn Collector>> {
        match method {
            SharingMethod::PushApi => Some(Arc::clone(&self.push_api)),
            SharingMethod::PullCsv => Some(Arc::clone(&self.pull_csv)),
            SharingMethod::Unsupported(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldchain_parser::RejectedRecord;
    use uuid::Uuid;

    use crate::types::IngestionStatus;

    fn tenant(url: Option<&str>) -> TenantSource {
        TenantSource {
            id: Uuid::new_v4(),
            code: "A".into(),
            sharing_method: SharingMethod::PushApi,
            source_url: url.map(str::to_string),
            polling_interval_seconds: 60,
            active: true,
        }
    }

    #[test]
    fn blank_source_url_is_missing() {
        assert!(matches!(
            source_url(&tenant(Some("  "))),
            Err(CollectorError::MissingSourceUrl(_))
        ));
        assert_eq!(source_url(&tenant(Some("http://x/"))).unwrap(), "http://x/");
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let body = "x".repeat(500);
        let cut = snippet(&body);
        assert_eq!(cut.len(), BODY_SNIPPET_CHARS + 3);
        assert_eq!(snippet(" short "), "short");
    }

    #[test]
    fn conclude_reports_rejections_as_warning() {
        let t = tenant(Some("http://x/"));
        let batch = ParsedBatch {
            records: vec![RawRecord::default()],
            rejected: vec![RejectedRecord::new(3, "bad temperature")],
        };
        let collection = conclude(&t, IngestionLogEntry::pending(&t), Ok(batch));
        assert_eq!(collection.records.len(), 1);
        assert_eq!(collection.log.status, IngestionStatus::Warning);
        assert_eq!(collection.log.records_failed, 1);
        assert!(collection
            .log
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("record 3")));
    }

    #[test]
    fn conclude_turns_errors_into_failure_logs() {
        let t = tenant(None);
        let collection = conclude(
            &t,
            IngestionLogEntry::pending(&t),
            Err(CollectorError::MissingSourceUrl("A".into())),
        );
        assert!(collection.records.is_empty());
        assert_eq!(collection.log.status, IngestionStatus::Failure);
        assert_eq!(collection.log.records_processed, 0);
    }
}
