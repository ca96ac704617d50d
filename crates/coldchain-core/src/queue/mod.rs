//! Durable topic queue between the processor and the batch writer.
//!
//! Deliveries stay unacknowledged until the consumer acks them explicitly;
//! anything nacked, or leased by a consumer that went away, is delivered again.

mod memory;
mod postgres;
pub mod topic;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::QueueConfig;
use crate::types::CanonicalEvent;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;
use topic::topic_matches;

pub type DeliveryTag = i64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("routing key '{routing_key}' matches no binding ('{binding}')")]
    Unroutable {
        routing_key: String,
        binding: String,
    },

    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// Errors worth retrying; encoding and routing failures never succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Database(_))
    }
}

/// Exchange, queue and binding the pipeline publishes and consumes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue_name: String,
    pub binding: String,
}

impl Topology {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue_name: config.queue_name.clone(),
            binding: config.binding.clone(),
        }
    }

    pub fn route(&self, routing_key: &str) -> Result<(), QueueError> {
        if topic_matches(&self.binding, routing_key) {
            Ok(())
        } else {
            Err(QueueError::Unroutable {
                routing_key: routing_key.to_string(),
                binding: self.binding.clone(),
            })
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// One message handed to a consumer. The payload stays undecoded so that a
/// message that no longer parses can still be dead-lettered and acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub payload: Value,
    pub redelivered: bool,
}

impl Delivery {
    pub fn event(&self) -> Result<CanonicalEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    fn topology(&self) -> &Topology;

    /// Returns once the message is stored.
    async fn publish(&self, event: &CanonicalEvent) -> Result<(), QueueError>;

    /// Waits up to `wait` for at least one delivery and returns at most `max`.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError>;

    /// Returns deliveries to the queue for redelivery.
    async fn nack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    async fn close(&self);
}
