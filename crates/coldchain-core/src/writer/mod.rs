//! Batch writer: drains the queue into `temperature_readings`.
//!
//! Deliveries are acked only after the batch holding them was inserted or
//! dead-lettered. A crash in between leaves them unacked for redelivery.

pub mod dead_letter;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::queue::{Delivery, DeliveryTag, EventQueue};
use crate::resilience::Backoff;
use crate::store::ReadingStore;
use crate::types::TemperatureReading;

pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink, ReplaySummary};

#[derive(Debug, Clone)]
struct PendingReading {
    tag: DeliveryTag,
    routing_key: String,
    payload: serde_json::Value,
    reading: TemperatureReading,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub received: u64,
    pub batches_flushed: u64,
    pub rows_written: u64,
    pub write_failures: u64,
    pub dead_lettered: u64,
}

pub struct BatchWriter {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn ReadingStore>,
    dead_letters: DeadLetterSink,
    config: WriterConfig,
    backoff: Backoff,
    pending: VecDeque<PendingReading>,
    last_flush: Instant,
    /// Consecutive failed attempts for the batch at the head of `pending`.
    failures: u32,
    retry_at: Option<Instant>,
    stats: WriterStats,
}

/// Running writer task.
pub struct WriterHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WriterStats>,
}

impl WriterHandle {
    /// Signals shutdown and waits for the final flush.
    pub async fn stop(self) -> WriterStats {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "writer task ended abnormally");
                WriterStats::default()
            }
        }
    }

    /// Kills the task without a final flush, as a crash would.
    pub fn abort(self) {
        self.task.abort();
    }
}

impl BatchWriter {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn ReadingStore>,
        dead_letters: DeadLetterSink,
        config: WriterConfig,
    ) -> Self {
        let backoff = Backoff::for_writes(&config);
        Self {
            queue,
            store,
            dead_letters,
            config,
            backoff,
            pending: VecDeque::new(),
            last_flush: Instant::now(),
            failures: 0,
            retry_at: None,
            stats: WriterStats::default(),
        }
    }

    pub fn spawn(self) -> WriterHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        WriterHandle { shutdown, task }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WriterStats {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_secs = self.config.batch_timeout_secs,
            max_pending = self.config.max_pending,
            "batch writer starting"
        );

        self.last_flush = Instant::now();
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let receive_wait = self.config.receive_wait();

        loop {
            let room = self.config.max_pending.saturating_sub(self.pending.len());
            let queue = Arc::clone(&self.queue);
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = queue.receive(room, receive_wait), if room > 0 => {
                    match received {
                        Ok(deliveries) => {
                            self.absorb(deliveries).await;
                            if self.retry_at.is_none() {
                                self.drain(false).await;
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "queue receive failed");
                            tick.tick().await;
                        }
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.shutdown_flush().await;
        info!(
            received = self.stats.received,
            batches = self.stats.batches_flushed,
            rows = self.stats.rows_written,
            failures = self.stats.write_failures,
            dead_lettered = self.stats.dead_lettered,
            "batch writer stopped"
        );
        self.stats
    }

    /// Converts deliveries to readings; anything unconvertible is
    /// dead-lettered and acked right away.
    async fn absorb(&mut self, deliveries: Vec<Delivery>) {
        let mut rejected = Vec::new();
        for delivery in deliveries {
            // An expired lease hands back a delivery still waiting here.
            if self.pending.iter().any(|held| held.tag == delivery.tag) {
                debug!(tag = delivery.tag, "delivery already pending");
                continue;
            }
            self.stats.received += 1;
            let converted = delivery
                .event()
                .map_err(|err| err.to_string())
                .and_then(|event| TemperatureReading::from_event(&event).map_err(|err| err.to_string()));
            match converted {
                Ok(reading) => self.pending.push_back(PendingReading {
                    tag: delivery.tag,
                    routing_key: delivery.routing_key,
                    payload: delivery.payload,
                    reading,
                }),
                Err(reason) => {
                    warn!(routing_key = %delivery.routing_key, reason = %reason, "unconvertible event");
                    rejected.push((
                        delivery.tag,
                        DeadLetter::new(
                            delivery.routing_key,
                            delivery.payload,
                            DeadLetterReason::Unconvertible,
                            reason,
                            1,
                        ),
                    ));
                }
            }
        }

        if !rejected.is_empty() {
            let (tags, letters): (Vec<_>, Vec<_>) = rejected.into_iter().unzip();
            self.settle_dead_letters(&tags, &letters).await;
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.retry_at {
            Some(at) if now >= at => self.drain(true).await,
            Some(_) => {}
            None => {
                let due = now.duration_since(self.last_flush) >= self.config.batch_timeout();
                if due && !self.pending.is_empty() {
                    self.drain(true).await;
                }
            }
        }
    }

    /// Flushes full batches, plus one trailing partial batch when `partial`.
    /// Stops at the first failed insert.
    async fn drain(&mut self, partial: bool) {
        loop {
            let len = self.pending.len();
            if len == 0 || (len < self.config.batch_size && !partial) {
                return;
            }
            let was_partial = len < self.config.batch_size;
            if !self.flush_batch().await || was_partial {
                return;
            }
        }
    }

    /// Inserts the head batch. Returns false when it failed and was put back.
    async fn flush_batch(&mut self) -> bool {
        let take = self.config.batch_size.min(self.pending.len());
        let batch: Vec<PendingReading> = self.pending.drain(..take).collect();
        let readings: Vec<TemperatureReading> = batch.iter().map(|p| p.reading.clone()).collect();
        let tags: Vec<DeliveryTag> = batch.iter().map(|p| p.tag).collect();

        match self.store.insert_batch(&readings).await {
            Ok(rows) => {
                self.stats.batches_flushed += 1;
                self.stats.rows_written += rows;
                self.failures = 0;
                self.retry_at = None;
                self.last_flush = Instant::now();
                debug!(rows, "flushed batch");
                self.ack(&tags).await;
                true
            }
            Err(err) => {
                self.stats.write_failures += 1;
                self.failures += 1;
                if self.failures > self.backoff.max_retries {
                    error!(
                        error = %err,
                        attempts = self.failures,
                        rows = batch.len(),
                        "batch insert retries exhausted, dead-lettering"
                    );
                    let letters: Vec<DeadLetter> = batch
                        .into_iter()
                        .map(|p| {
                            DeadLetter::new(
                                p.routing_key,
                                p.payload,
                                DeadLetterReason::WriteFailed,
                                err.to_string(),
                                self.failures,
                            )
                        })
                        .collect();
                    self.failures = 0;
                    self.retry_at = None;
                    self.last_flush = Instant::now();
                    self.settle_dead_letters(&tags, &letters).await;
                    true
                } else {
                    let delay = self.backoff.delay(self.failures - 1);
                    warn!(
                        error = %err,
                        attempt = self.failures,
                        retry_in_ms = delay.as_millis() as u64,
                        rows = batch.len(),
                        "batch insert failed, will retry"
                    );
                    for pending in batch.into_iter().rev() {
                        self.pending.push_front(pending);
                    }
                    self.retry_at = Some(Instant::now() + delay);
                    false
                }
            }
        }
    }

    /// Writes dead letters, then acks. If the dead letters cannot be written
    /// the deliveries are released for redelivery instead.
    async fn settle_dead_letters(&mut self, tags: &[DeliveryTag], letters: &[DeadLetter]) {
        match self.dead_letters.write(letters).await {
            Ok(_) => {
                self.stats.dead_lettered += letters.len() as u64;
                self.ack(tags).await;
            }
            Err(err) => {
                error!(error = %err, count = letters.len(), "failed to write dead letters, releasing deliveries");
                if let Err(err) = self.queue.nack(tags).await {
                    error!(error = %err, "failed to release deliveries");
                }
            }
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) {
        if let Err(err) = self.queue.ack(tags).await {
            // Rows are stored; the deliveries will come back and be written again.
            error!(error = %err, count = tags.len(), "failed to ack flushed deliveries");
        }
    }

    /// One insert attempt per remaining batch; whatever is left is released.
    async fn shutdown_flush(&mut self) {
        while !self.pending.is_empty() {
            let take = self.config.batch_size.min(self.pending.len());
            let readings: Vec<TemperatureReading> =
                self.pending.iter().take(take).map(|p| p.reading.clone()).collect();
            match self.store.insert_batch(&readings).await {
                Ok(rows) => {
                    let tags: Vec<DeliveryTag> = self.pending.drain(..take).map(|p| p.tag).collect();
                    self.stats.batches_flushed += 1;
                    self.stats.rows_written += rows;
                    self.ack(&tags).await;
                }
                Err(err) => {
                    self.stats.write_failures += 1;
                    warn!(error = %err, remaining = self.pending.len(), "final flush failed, releasing deliveries");
                    break;
                }
            }
        }

        if !self.pending.is_empty() {
            let tags: Vec<DeliveryTag> = self.pending.drain(..).map(|p| p.tag).collect();
            if let Err(err) = self.queue.nack(&tags).await {
                error!(error = %err, "failed to release unflushed deliveries");
            }
        }
    }
}
