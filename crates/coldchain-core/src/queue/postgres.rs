use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::time::Instant;

use super::{Delivery, DeliveryTag, EventQueue, QueueError, Topology};
use crate::types::CanonicalEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Queue stored in the `event_queue` table. A receive leases rows for the
/// visibility timeout; rows are deleted on ack and leases expire on their
/// own when a consumer disappears.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    topology: Topology,
    visibility_timeout: Duration,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, topology: Topology, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            topology,
            visibility_timeout,
        }
    }

    /// Enqueue a raw payload, bypassing event encoding.
    pub async fn publish_value(&self, routing_key: &str, payload: Value) -> Result<(), QueueError> {
        self.topology.route(routing_key)?;
        sqlx::query(
            r#"
            INSERT INTO event_queue (queue_name, routing_key, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&self.topology.queue_name)
        .bind(routing_key)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE event_queue
            SET locked_until = NOW() + make_interval(secs => $3),
                delivery_count = delivery_count + 1
            WHERE delivery_id IN (
                SELECT delivery_id
                FROM event_queue
                WHERE queue_name = $1
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY delivery_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING delivery_id, routing_key, payload, delivery_count
            "#,
        )
        .bind(&self.topology.queue_name)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = rows
            .into_iter()
            .map(|row| {
                let delivery_count: i32 = row.try_get("delivery_count")?;
                Ok(Delivery {
                    tag: row.try_get("delivery_id")?,
                    routing_key: row.try_get("routing_key")?,
                    payload: row.try_get("payload")?,
                    redelivered: delivery_count > 1,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        deliveries.sort_by_key(|delivery| delivery.tag);
        Ok(deliveries)
    }

    /// Messages stored for this queue, leased or not.
    pub async fn depth(&self) -> Result<i64, QueueError> {
        let depth = sqlx::query_scalar("SELECT COUNT(*) FROM event_queue WHERE queue_name = $1")
            .bind(&self.topology.queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }
}

#[async_trait]
impl EventQueue for PostgresQueue {
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
            let deliveries = self.lease(max).await?;
            let now = Instant::now();
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM event_queue WHERE delivery_id = ANY($1)")
            .bind(tags)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, tags: &[DeliveryTag]) -> Result<(), QueueError> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE event_queue SET locked_until = NULL WHERE delivery_id = ANY($1)")
            .bind(tags)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1 FROM event_queue LIMIT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {}
}
