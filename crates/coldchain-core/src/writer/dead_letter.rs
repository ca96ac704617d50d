//! Dead-letter sink for deliveries the writer gives up on.
//!
//! Records are appended as NDJSON, one file per UTC day, so they can be
//! inspected with ordinary tools and replayed onto the queue later.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::{EventQueue, QueueError};
use crate::types::CanonicalEvent;

const FILE_PREFIX: &str = "dead-letters-";
const FILE_SUFFIX: &str = ".ndjson";

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to republish dead letter: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome of replaying dead letters onto the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub files: usize,
    pub republished: usize,
    /// Letters whose payload is not an event and cannot be republished.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The payload could not be turned into a reading.
    Unconvertible,
    /// The insert kept failing until retries ran out.
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub tenant_id: Option<Uuid>,
    pub routing_key: String,
    pub payload: Value,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        routing_key: impl Into<String>,
        payload: Value,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let tenant_id = payload
            .get("tenant_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());
        Self {
            tenant_id,
            routing_key: routing_key.into(),
            payload,
            reason,
            error: error.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn event(&self) -> Result<CanonicalEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterSink {
    dir: PathBuf,
}

impl DeadLetterSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DeadLetterError + '_ {
        move |source| DeadLetterError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Appends `letters` and syncs the file before returning.
    pub async fn write(&self, letters: &[DeadLetter]) -> Result<PathBuf, DeadLetterError> {
        let path = self
            .dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", Utc::now().format("%Y%m%d")));
        if letters.is_empty() {
            return Ok(path);
        }

        let ndjson = encode(letters)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Self::io_error(&self.dir))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Self::io_error(&path))?;
        file.write_all(ndjson.as_bytes())
            .await
            .map_err(Self::io_error(&path))?;
        file.sync_all().await.map_err(Self::io_error(&path))?;

        warn!(
            path = %path.display(),
            count = letters.len(),
            reason = ?letters[0].reason,
            "wrote dead letters"
        );
        Ok(path)
    }

    /// Dead-letter files in the directory, oldest first.
    pub fn files(&self) -> Result<Vec<PathBuf>, DeadLetterError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_error(&self.dir)(err)),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Reads every record in one file. Lines that do not parse are skipped.
    pub fn read_file(path: &Path) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let raw = std::fs::read_to_string(path).map_err(Self::io_error(path))?;
        let mut letters = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(letter) => letters.push(letter),
                Err(err) => warn!(path = %path.display(), line = line_no + 1, error = %err, "skipping unreadable dead letter"),
            }
        }
        Ok(letters)
    }

    /// Republishes every letter in every file, then marks each file replayed.
    /// A file is only marked once all of its letters were published. When a
    /// publish fails the file is rewritten without the letters already
    /// republished, so a later replay does not send them twice.
    pub async fn replay(&self, queue: &dyn EventQueue) -> Result<ReplaySummary, DeadLetterError> {
        let mut summary = ReplaySummary::default();
        for path in self.files()? {
            let letters = Self::read_file(&path)?;
            let mut skipped = Vec::new();
            for (index, letter) in letters.iter().enumerate() {
                match letter.event() {
                    Ok(event) => {
                        if let Err(err) = queue.publish(&event).await {
                            skipped.extend_from_slice(&letters[index..]);
                            Self::rewrite(&path, &skipped)?;
                            warn!(
                                path = %path.display(),
                                republished = summary.republished,
                                remaining = skipped.len(),
                                error = %err,
                                "dead-letter replay interrupted"
                            );
                            return Err(err.into());
                        }
                        summary.republished += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "dead letter is not an event, skipping");
                        summary.skipped += 1;
                        skipped.push(letter.clone());
                    }
                }
            }
            Self::mark_replayed(&path)?;
            summary.files += 1;
        }
        info!(
            files = summary.files,
            republished = summary.republished,
            skipped = summary.skipped,
            "dead-letter replay finished"
        );
        Ok(summary)
    }

    /// Replaces the contents of `path` with `letters`.
    fn rewrite(path: &Path, letters: &[DeadLetter]) -> Result<(), DeadLetterError> {
        let staging = path.with_extension("ndjson.tmp");
        std::fs::write(&staging, encode(letters)?).map_err(Self::io_error(&staging))?;
        std::fs::rename(&staging, path).map_err(Self::io_error(path))?;
        Ok(())
    }

    /// Renames a replayed file so it is not picked up again.
    pub fn mark_replayed(path: &Path) -> Result<PathBuf, DeadLetterError> {
        let target = path.with_extension("ndjson.replayed");
        std::fs::rename(path, &target).map_err(Self::io_error(path))?;
        info!(from = %path.display(), to = %target.display(), "dead-letter file replayed");
        Ok(target)
    }
}

fn encode(letters: &[DeadLetter]) -> Result<String, serde_json::Error> {
    let mut ndjson = String::new();
    for letter in letters {
        ndjson.push_str(&serde_json::to_string(letter)?);
        ndjson.push('\n');
    }
    Ok(ndjson)
}
