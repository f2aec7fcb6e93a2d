//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive. The same queues back trigger sources, notification topics,
//! and dead-letter queues.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use super::Db;
use crate::error::{Error, Result};
use crate::notify::topic::TopicPublisher;
use crate::telemetry::metrics;
use crate::trigger::{DeadLetter, DeadLetterQueue, MessageSource, QueueMessage};

/// Visibility timeout applied to reads when none is configured.
pub const DEFAULT_VISIBILITY_SECS: i32 = 30;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl From<PgmqMessage> for QueueMessage {
    fn from(m: PgmqMessage) -> Self {
        QueueMessage {
            message_id: m.msg_id.to_string(),
            body: m.message,
            enqueued_at: m.enqueued_at,
            read_count: m.read_ct,
        }
    }
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, hiding them for `vt_seconds`.
    /// Messages not archived before the timeout become visible again.
    pub async fn read_batch(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)")
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(&self.pool)
        .await?;

        record(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record(queue_name, "archive");
        Ok(())
    }
}

/// Topics are pgmq queues named after the topic.
#[async_trait]
impl TopicPublisher for Db {
    async fn publish(&self, topic: &str, message: &serde_json::Value) -> Result<()> {
        self.send_to_queue(topic, message, 0).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger source
// ---------------------------------------------------------------------------

/// A pgmq queue read in batches by a trigger.
pub struct PgmqSource {
    db: Arc<Db>,
    queue: String,
    visibility_secs: i32,
}

impl PgmqSource {
    pub fn new(db: Arc<Db>, queue: impl Into<String>) -> Self {
        Self {
            db,
            queue: queue.into(),
            visibility_secs: DEFAULT_VISIBILITY_SECS,
        }
    }

    pub fn visibility_secs(mut self, secs: i32) -> Self {
        self.visibility_secs = secs;
        self
    }
}

#[async_trait]
impl MessageSource for PgmqSource {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let qty = i32::try_from(max).unwrap_or(i32::MAX);
        let batch = self
            .db
            .read_batch(&self.queue, self.visibility_secs, qty)
            .await?;
        Ok(batch.into_iter().map(QueueMessage::from).collect())
    }

    async fn ack(&self, messages: &[QueueMessage]) -> Result<()> {
        for message in messages {
            let msg_id: i64 = message.message_id.parse().map_err(|_| {
                Error::Other(format!(
                    "queue {} returned non-numeric message id {}",
                    self.queue, message.message_id
                ))
            })?;
            self.db.archive_message(&self.queue, msg_id).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

pub struct PgmqDeadLetters {
    db: Arc<Db>,
    queue: String,
}

impl PgmqDeadLetters {
    pub fn new(db: Arc<Db>, queue: impl Into<String>) -> Self {
        Self {
            db,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl DeadLetterQueue for PgmqDeadLetters {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_value(letter)?;
        self.db.send_to_queue(&self.queue, &payload, 0).await?;
        Ok(())
    }
}
