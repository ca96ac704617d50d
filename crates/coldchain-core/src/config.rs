//! Runtime configuration, loaded from TOML with every section defaulted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::queue::topic::validate_pattern;
use crate::resilience::Backoff;

pub const CONFIG_ENV: &str = "COLDCHAIN_CONFIG";
pub const DATABASE_URL_ENVS: &[&str] = &["COLDCHAIN_DATABASE_URL", "DATABASE_URL"];

/// Columns bound per reading in the batch insert.
const READING_BIND_COLUMNS: usize = 10;
const POSTGRES_MAX_BINDS: usize = 65_535;
pub const MAX_BATCH_SIZE: usize = POSTGRES_MAX_BINDS / READING_BIND_COLUMNS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no database URL configured; set DATABASE_URL or [database].url")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub collector: CollectorConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub writer: WriterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    #[default]
    Postgres,
    Static,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Tenant file for the static backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub timeout_secs: u64,
    /// Audit copies of downloaded CSV files land here.
    pub download_dir: PathBuf,
    pub user_agent: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            download_dir: PathBuf::from("data/downloads"),
            user_agent: concat!("coldchain/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_secs: u64,
    /// How often the active tenant list is reloaded. Zero disables reloading.
    pub registry_refresh_secs: u64,
    pub job_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 10,
            registry_refresh_secs: 60,
            job_timeout_secs: 120,
        }
    }
}

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn registry_refresh(&self) -> Option<Duration> {
        (self.registry_refresh_secs > 0).then(|| Duration::from_secs(self.registry_refresh_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Postgres,
    Memory,
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::Postgres => "postgres",
            QueueBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub exchange: String,
    pub queue_name: String,
    pub binding: String,
    /// Bound of the in-memory backend; publishers wait when it is full.
    pub capacity: usize,
    /// Leased deliveries return to the queue after this long without an ack.
    pub visibility_timeout_secs: u64,
    pub publish_retries: u32,
    pub publish_backoff_ms: u64,
    pub publish_backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Postgres,
            exchange: "temperature_data".to_string(),
            queue_name: "temperature_readings".to_string(),
            binding: "reading.#".to_string(),
            capacity: 10_000,
            visibility_timeout_secs: 300,
            publish_retries: 3,
            publish_backoff_ms: 200,
            publish_backoff_max_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout_secs: u64,
    pub tick_ms: u64,
    pub max_pending: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Longest a single receive call blocks waiting for deliveries.
    pub receive_wait_ms: u64,
    pub dead_letter_dir: PathBuf,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_secs: 5,
            tick_ms: 1_000,
            max_pending: 1_000,
            max_retries: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            receive_wait_ms: 500,
            dead_letter_dir: PathBuf::from("data/dead_letters"),
        }
    }
}

impl WriterConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, or the file named by `COLDCHAIN_CONFIG`, or defaults when
    /// neither exists. Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };

        let config = config.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = DATABASE_URL_ENVS
            .iter()
            .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        {
            self.database.url = Some(url);
        }
        self
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let writer = &self.writer;
        if writer.batch_size == 0 {
            return Err(ConfigError::Invalid("writer.batch_size must be positive".into()));
        }
        if writer.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "writer.batch_size {} exceeds the insert limit of {MAX_BATCH_SIZE}",
                writer.batch_size
            )));
        }
        if writer.max_pending < writer.batch_size {
            return Err(ConfigError::Invalid(
                "writer.max_pending must be at least writer.batch_size".into(),
            ));
        }
        for (name, value) in [
            ("writer.batch_timeout_secs", writer.batch_timeout_secs),
            ("writer.tick_ms", writer.tick_ms),
            ("collector.timeout_secs", self.collector.timeout_secs),
            ("scheduler.job_timeout_secs", self.scheduler.job_timeout_secs),
            ("scheduler.min_interval_secs", self.scheduler.min_interval_secs),
            ("queue.visibility_timeout_secs", self.queue.visibility_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be positive".into()));
        }
        if self.queue.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.queue_name must not be empty".into()));
        }
        validate_pattern(&self.queue.binding).map_err(ConfigError::Invalid)?;
        if self.queue.backend == QueueBackend::Postgres {
            // A lease must outlive the longest a delivery can sit in the writer
            // unacked, or it is re-leased while still pending.
            let hold = writer.batch_timeout()
                + writer.tick()
                + Backoff::for_writes(writer).total_delay();
            if self.queue.visibility_timeout() <= hold {
                return Err(ConfigError::Invalid(format!(
                    "queue.visibility_timeout_secs ({}) must exceed the writer's hold budget of {:.1}s \
                     (batch_timeout_secs + tick_ms + retry backoff)",
                    self.queue.visibility_timeout_secs,
                    hold.as_secs_f64()
                )));
            }
        }
        if self.registry.backend == RegistryBackend::Static && self.registry.path.is_none() {
            return Err(ConfigError::Invalid(
                "registry.path is required for the static registry".into(),
            ));
        }
        Ok(())
    }
}
