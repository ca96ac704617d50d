use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use coldchain_parser::{parser_for, ParsedBatch, SourceFormat};
use tracing::{debug, info};
use uuid::Uuid;

use super::{conclude, source_url, Collection, Collector, CollectorError, HttpSource};
use crate::config::CollectorConfig;
use crate::types::{IngestionLogEntry, SharingMethod, TenantSource};

/// Downloads a tenant CSV export, keeps an audit copy, then parses it row by
/// row on the blocking pool.
pub struct PullCsvCollector {
    http: HttpSource,
    download_dir: PathBuf,
}

impl PullCsvCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        Ok(Self {
            http: HttpSource::new(config)?,
            download_dir: config.download_dir.clone(),
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// `{code}_{timestamp}_{log id prefix}.csv`; the log id keeps two
    /// attempts within the same millisecond apart.
    fn audit_path(&self, tenant_code: &str, log_id: Uuid) -> PathBuf {
        let safe_code: String = tenant_code
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let attempt = log_id.simple().to_string();
        self.download_dir
            .join(format!("{safe_code}_{stamp}_{}.csv", &attempt[..8]))
    }

    async fn write_audit_copy(&self, tenant: &TenantSource, log_id: Uuid, body: &[u8]) -> Result<PathBuf, CollectorError> {
        let path = self.audit_path(&tenant.code, log_id);
        let audit_error = |source| CollectorError::Audit {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(audit_error)?;
        tokio::fs::write(&path, body).await.map_err(audit_error)?;

        info!(
            tenant = %tenant.code,
            path = %path.display(),
            bytes = body.len(),
            blake3 = %blake3::hash(body).to_hex(),
            "stored CSV audit copy"
        );
        Ok(path)
    }

    async fn try_fetch(&self, tenant: &TenantSource, log_id: Uuid) -> Result<ParsedBatch, CollectorError> {
        let url = source_url(tenant)?;
        debug!(tenant = %tenant.code, url, "downloading CSV export");
        let body = self.http.get(url).await?;
        self.write_audit_copy(tenant, log_id, &body).await?;

        let parser = parser_for(SourceFormat::Csv);
        debug!(tenant = %tenant.code, parser = parser.name(), bytes = body.len(), "parsing export");
        let batch = tokio::task::spawn_blocking(move || parser.parse(&body))
            .await
            .map_err(|err| CollectorError::Task(err.to_string()))??;
        Ok(batch)
    }
}

#[async_trait]
impl Collector for PullCsvCollector {
    fn method(&self) -> SharingMethod {
        SharingMethod::PullCsv
    }

    async fn fetch(&self, tenant: &TenantSource, log: IngestionLogEntry) -> Collection {
        let outcome = self.try_fetch(tenant, log.id).await;
        conclude(tenant, log, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_names_differ_per_attempt() {
        let collector = PullCsvCollector::new(&CollectorConfig::default()).unwrap();
        let first = collector.audit_path("A/north", Uuid::new_v4());
        let second = collector.audit_path("A/north", Uuid::new_v4());
        assert_ne!(first, second);

        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("A_north_"));
        assert!(name.ends_with(".csv"));
        // code, date, time, millis, attempt
        assert_eq!(name.trim_end_matches(".csv").split('_').count(), 6);
    }
}
