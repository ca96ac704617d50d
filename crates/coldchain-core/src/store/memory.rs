use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{IngestionLogStore, ReadingStore, StoreError};
use crate::types::{IngestionLogEntry, TemperatureReading, TenantId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reading store kept in memory. Failures can be scripted to exercise the
/// writer's retry path.
#[derive(Default)]
pub struct MemoryReadingStore {
    rows: Mutex<Vec<TemperatureReading>>,
    failures: Mutex<VecDeque<String>>,
    attempts: Mutex<usize>,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` inserts fail with `message`.
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    pub fn rows(&self) -> Vec<TemperatureReading> {
        lock(&self.rows).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    /// Insert calls seen, successful or not.
    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn insert_batch(&self, readings: &[TemperatureReading]) -> Result<u64, StoreError> {
        *lock(&self.attempts) += 1;
        if let Some(message) = lock(&self.failures).pop_front() {
            return Err(StoreError::Unavailable(message));
        }
        let mut rows = lock(&self.rows);
        let mut inserted = 0;
        for reading in readings {
            if rows.iter().any(|row| row.id == reading.id) {
                continue;
            }
            rows.push(reading.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[derive(Default)]
pub struct MemoryLogStore {
    entries: Mutex<Vec<IngestionLogEntry>>,
    insert_failures: Mutex<VecDeque<String>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` inserts fail with `message`.
    pub fn fail_next_insert(&self, count: usize, message: &str) {
        let mut failures = lock(&self.insert_failures);
        failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    pub fn entries(&self) -> Vec<IngestionLogEntry> {
        lock(&self.entries).clone()
    }

    pub fn for_tenant(&self, tenant_id: TenantId) -> Vec<IngestionLogEntry> {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IngestionLogStore for MemoryLogStore {
    async fn insert(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        if let Some(message) = lock(&self.insert_failures).pop_front() {
            return Err(StoreError::Unavailable(message));
        }
        lock(&self.entries).push(entry.clone());
        Ok(())
    }

    async fn finalize(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let existing = entries
            .iter_mut()
            .find(|existing| existing.id == entry.id)
            .ok_or(StoreError::NotFound(entry.id))?;
        *existing = entry.clone();
        Ok(())
    }

    async fn recent(
        &self,
        tenant_id: Option<TenantId>,
        limit: i64,
    ) -> Result<Vec<IngestionLogEntry>, StoreError> {
        let mut entries: Vec<_> = lock(&self.entries)
            .iter()
            .filter(|entry| tenant_id.map_or(true, |id| entry.tenant_id == id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }
}
