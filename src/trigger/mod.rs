//! Trigger adapters: deliver one work unit per invocation to a workflow.
//!
//! Every trigger is at-least-once. Duplicates are expected and suppressed by
//! the workflow's idempotency admission, never here.

pub mod queue;
pub mod schedule;
pub mod storage_event;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, warn};

use crate::engine::{RunHandle, Workflow};
use crate::error::Result;
use crate::model::WorkUnit;
use crate::telemetry::metrics;

pub use queue::{MemoryQueue, MessageSource, QueueMessage, QueueTrigger};
pub use schedule::{CronMinute, ScheduleTrigger};
pub use storage_event::{Delivery, ObjectCreatedRule, StorageEventTrigger};

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Broadcast stop signal shared by all trigger loops.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An Err means the sender is gone, which also means stop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Any trigger, as assembled from a workflow definition.
pub enum Trigger {
    Schedule(ScheduleTrigger),
    Queue(QueueTrigger),
    StorageEvent(StorageEventTrigger),
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Schedule(_) => "schedule",
            Trigger::Queue(_) => "queue",
            Trigger::StorageEvent(_) => "storage_event",
        }
    }

    /// Deliver until shutdown.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        match self {
            Trigger::Schedule(t) => t.run(shutdown).await,
            Trigger::Queue(t) => t.run(shutdown).await,
            Trigger::StorageEvent(t) => t.run(shutdown).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// A payload a trigger could not hand to its workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub trigger: String,
    pub workflow: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetters {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        self.letters.lock().push(letter.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hand-off
// ---------------------------------------------------------------------------

/// Outcome of offering one unit to a workflow.
#[derive(Debug)]
pub(crate) enum HandOff {
    Started(RunHandle),
    /// Refused, and the payload is now on the dead-letter queue.
    DeadLettered,
    /// Refused with nowhere to put the payload. The caller must keep it.
    Refused,
}

impl HandOff {
    pub(crate) fn into_handle(self) -> Option<RunHandle> {
        match self {
            HandOff::Started(handle) => Some(handle),
            HandOff::DeadLettered | HandOff::Refused => None,
        }
    }
}

/// Start a run for `unit`. On refusal, route the payload to `dlq` if one is
/// configured.
pub(crate) async fn hand_off(
    trigger: &'static str,
    workflow: &Workflow,
    unit: WorkUnit,
    dlq: Option<&dyn DeadLetterQueue>,
) -> HandOff {
    let labels = |result: &'static str| {
        [
            KeyValue::new("trigger", trigger),
            KeyValue::new("workflow", workflow.name().to_string()),
            KeyValue::new("result", result),
        ]
    };

    let payload = unit.payload().clone();
    let reason = match workflow.start(unit) {
        Ok(handle) => {
            metrics::trigger_deliveries().add(1, &labels("handed_off"));
            return HandOff::Started(handle);
        }
        Err(e) => e.to_string(),
    };
    metrics::trigger_deliveries().add(1, &labels("refused"));
    warn!(trigger, workflow = workflow.name(), error = %reason, "hand-off refused");

    let Some(dlq) = dlq else {
        return HandOff::Refused;
    };
    let letter = DeadLetter {
        trigger: trigger.to_string(),
        workflow: workflow.name().to_string(),
        payload,
        reason,
        failed_at: Utc::now(),
    };
    match dlq.send(&letter).await {
        Ok(()) => {
            metrics::dead_letters().add(
                1,
                &[
                    KeyValue::new("trigger", trigger),
                    KeyValue::new("workflow", workflow.name().to_string()),
                ],
            );
            HandOff::DeadLettered
        }
        Err(e) => {
            error!(trigger, workflow = workflow.name(), error = %e, "dead letter not written");
            HandOff::Refused
        }
    }
}
