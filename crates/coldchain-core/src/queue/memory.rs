use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use super::{Delivery, DeliveryTag, EventQueue, QueueError, Topology};
use crate::types::CanonicalEvent;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Value,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_tag: DeliveryTag,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<DeliveryTag, StoredMessage>,
}

/// Bounded in-process queue. A slot is held from publish until ack, so a
/// slow consumer pushes back on publishers once `capacity` messages are in flight.
pub struct MemoryQueue {
    topology: Topology,
    state: Mutex<MemoryState>,
    slots: Semaphore,
    ready_signal: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(topology: Topology, capacity: usize) -> Self {
        Self {
            topology,
            state: Mutex::new(MemoryState::default()),
            slots: Semaphore::new(capacity.max(1)),
            ready_signal: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages delivered but not yet acked.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Puts every unacked delivery back in front of the queue, as a broker
    /// does when a consumer's channel drops.
    pub fn recover(&self) {
        let mut state = self.lock();
        let mut tags: Vec<DeliveryTag> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(mut message) = state.unacked.remove(&tag) {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        drop(state);
        self.ready_signal.notify_one();
    }

    /// Enqueue a raw payload, bypassing event encoding.
    pub async fn publish_value(&self, routing_key: &str, payload: Value) -> Result<(), QueueError> {
        self.topology.route(routing_key)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let permit = self.slots.acquire().await.map_err(|_| QueueError::Closed)?;
        permit.forget();

        self.lock().ready.push_back(StoredMessage {
            routing_key: routing_key.to_string(),
            payload,
            redelivered: false,
        });
        self.ready_signal.notify_one();
        Ok(())
    }

    fn take_ready(&self, max: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let count = max.min(state.ready.len());
        let mut deliveries = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            deliveries.push(Delivery {
                tag,
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
            });
            state.unacked.insert(tag, message);
        }
        deliveries
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn publish(&self, event: &CanonicalEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_value(event)?;
        self.publish_value(&event.routing_key, payload).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let deliveries = self.take_ready(max);
            if !deliveries.is_empty() || self.closed.load(Ordering::Acquire) {
                return Ok(deliveries);
            }
            if tokio::time::timeout_at(deadline, self.ready_signal.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError> {
        let released = {
            let mut state = self.lock();
            tags.iter()
                .filter(|tag| state.unacked.remove(*tag).is_some())
                .count()
        };
        self.slots.add_permits(released);
        Ok(())
    }

    async fn nack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError> {
        let mut state = self.lock();
        for tag in tags.iter().rev() {
            if let Some(mut message) = state.unacked.remove(tag) {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        drop(state);
        self.ready_signal.notify_one();
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.ready_signal.notify_waiters();
    }
}
