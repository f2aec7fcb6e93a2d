//! Queue trigger: polls a message queue and hands each batch to a workflow
//! as one work unit.
//!
//! The work unit is a JSON array of message records:
//!
//! ```json
//! [{"messageId": "17", "body": {...}, "enqueuedAt": "...", "readCount": 1}]
//! ```
//!
//! A batch is acknowledged only after the workflow accepts it. A refused batch
//! stays on the queue and is redelivered once its visibility timeout lapses.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{Shutdown, hand_off};
use crate::engine::{RunHandle, Workflow};
use crate::error::Result;
use crate::model::WorkUnit;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One message as presented to the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub body: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub read_count: i32,
}

/// A queue a trigger can poll.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Receive up to `max` visible messages, hiding them from other readers.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Remove messages for good.
    async fn ack(&self, messages: &[QueueMessage]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    visible: VecDeque<QueueMessage>,
    hidden: Vec<QueueMessage>,
}

/// In-process queue. Received messages stay hidden until acked or
/// [`MemoryQueue::expire_visibility`] returns them to the front.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Enqueue a body under a generated id. Returns the id.
    pub fn send(&self, body: serde_json::Value) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.visible.push_back(QueueMessage {
            message_id: id.clone(),
            body,
            enqueued_at: Utc::now(),
            read_count: 0,
        });
        id
    }

    /// Enqueue a body under a caller-chosen id.
    pub fn send_with_id(&self, message_id: impl Into<String>, body: serde_json::Value) {
        self.state.lock().visible.push_back(QueueMessage {
            message_id: message_id.into(),
            body,
            enqueued_at: Utc::now(),
            read_count: 0,
        });
    }

    /// Make every hidden message visible again, as if its timeout lapsed.
    pub fn expire_visibility(&self) {
        let mut state = self.state.lock();
        let hidden = std::mem::take(&mut state.hidden);
        for message in hidden.into_iter().rev() {
            state.visible.push_front(message);
        }
    }

    pub fn visible(&self) -> usize {
        self.state.lock().visible.len()
    }

    pub fn hidden(&self) -> usize {
        self.state.lock().hidden.len()
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut state = self.state.lock();
        let take = max.min(state.visible.len());
        let drained: Vec<QueueMessage> = state.visible.drain(..take).collect();
        let mut batch = Vec::with_capacity(take);
        for mut message in drained {
            message.read_count += 1;
            state.hidden.push(message.clone());
            batch.push(message);
        }
        Ok(batch)
    }

    async fn ack(&self, messages: &[QueueMessage]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .hidden
            .retain(|h| !messages.iter().any(|m| m.message_id == h.message_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

pub struct QueueTrigger {
    source: Arc<dyn MessageSource>,
    workflow: Workflow,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueTrigger {
    pub fn new(source: Arc<dyn MessageSource>, workflow: Workflow) -> Self {
        Self {
            source,
            workflow,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the work unit for a batch.
    pub fn batch_unit(batch: &[QueueMessage]) -> Result<WorkUnit> {
        Ok(WorkUnit::new(serde_json::to_value(batch)?))
    }

    /// Receive one batch and hand it off. `Ok(None)` when the queue was
    /// empty or the workflow refused the batch.
    pub async fn poll_once(&self) -> Result<Option<RunHandle>> {
        let batch = self.source.receive(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(None);
        }

        let unit = Self::batch_unit(&batch)?;
        match hand_off("queue", &self.workflow, unit, None).await.into_handle() {
            Some(handle) => {
                self.source.ack(&batch).await?;
                debug!(
                    queue = self.source.name(),
                    messages = batch.len(),
                    run_id = %handle.id(),
                    "batch handed off"
                );
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    /// Poll until shutdown. An empty or refused poll waits one interval.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        info!(
            queue = self.source.name(),
            workflow = self.workflow.name(),
            "queue trigger started"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(queue = self.source.name(), error = %e, "queue poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(queue = self.source.name(), "queue trigger stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_queue_hides_until_acked() {
        let queue = MemoryQueue::new("q");
        queue.send(json!({"n": 1}));
        queue.send(json!({"n": 2}));
        queue.send(json!({"n": 3}));

        let batch = queue.receive(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].read_count, 1);
        assert_eq!(queue.visible(), 1);
        assert_eq!(queue.hidden(), 2);

        queue.ack(&batch[..1]).await.unwrap();
        queue.expire_visibility();
        assert_eq!(queue.visible(), 2);

        let again = queue.receive(10).await.unwrap();
        assert_eq!(again[0].message_id, batch[1].message_id);
        assert_eq!(again[0].read_count, 2);
    }

    #[test]
    fn batch_unit_uses_camel_case_records() {
        let batch = vec![QueueMessage {
            message_id: "abc-123".into(),
            body: json!({"x": 1}),
            enqueued_at: Utc::now(),
            read_count: 1,
        }];
        let unit = QueueTrigger::batch_unit(&batch).unwrap();
        assert_eq!(unit.payload()[0]["messageId"], "abc-123");
        assert_eq!(unit.payload()[0]["readCount"], 1);
        assert_eq!(unit.payload()[0]["body"]["x"], 1);
    }
}
