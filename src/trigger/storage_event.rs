//! Storage-event trigger: routes "object created" events for one bucket to a
//! workflow. The whole event is the work unit.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tracing::{error, info, trace};

use super::queue::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL, MessageSource};
use super::{DeadLetterQueue, HandOff, Shutdown, hand_off};
use crate::engine::{RunHandle, Workflow};
use crate::error::Result;
use crate::model::WorkUnit;
use crate::telemetry::metrics;

pub const EVENT_SOURCE: &str = "aws.s3";
pub const OBJECT_CREATED: &str = "Object Created";

/// Matches object-created events for a single bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreatedRule {
    bucket: String,
}

impl ObjectCreatedRule {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn matches(&self, event: &Value) -> bool {
        event.get("source").and_then(Value::as_str) == Some(EVENT_SOURCE)
            && event.get("detail-type").and_then(Value::as_str) == Some(OBJECT_CREATED)
            && event
                .pointer("/detail/bucket/name")
                .and_then(Value::as_str)
                == Some(self.bucket.as_str())
    }
}

/// An object-created event in the shape the rule matches.
pub fn object_created_event(bucket: &str, key: &str) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "source": EVENT_SOURCE,
        "detail-type": OBJECT_CREATED,
        "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "detail": {
            "bucket": { "name": bucket },
            "object": { "key": key },
        },
    })
}

/// What happened to one event.
#[derive(Debug)]
pub enum Delivery {
    /// The rule did not match.
    Ignored,
    HandedOff(RunHandle),
    /// The workflow refused the event and it went to the dead-letter queue.
    DeadLettered,
    /// The workflow refused the event and no dead-letter queue took it. The
    /// event stays on the bus for redelivery.
    Refused,
}

impl Delivery {
    /// Whether the event can be removed from the bus.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Delivery::Refused)
    }
}

pub struct StorageEventTrigger {
    rule: ObjectCreatedRule,
    workflow: Workflow,
    events: Arc<dyn MessageSource>,
    dlq: Option<Arc<dyn DeadLetterQueue>>,
    poll_interval: Duration,
}

impl StorageEventTrigger {
    pub fn new(
        rule: ObjectCreatedRule,
        events: Arc<dyn MessageSource>,
        workflow: Workflow,
    ) -> Self {
        Self {
            rule,
            workflow,
            events,
            dlq: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn dead_letters(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn deliver(&self, event: Value) -> Delivery {
        if !self.rule.matches(&event) {
            trace!(bucket = self.rule.bucket(), "event ignored");
            metrics::trigger_deliveries().add(
                1,
                &[
                    KeyValue::new("trigger", "storage_event"),
                    KeyValue::new("workflow", self.workflow.name().to_string()),
                    KeyValue::new("result", "ignored"),
                ],
            );
            return Delivery::Ignored;
        }

        match hand_off(
            "storage_event",
            &self.workflow,
            WorkUnit::new(event),
            self.dlq.as_deref(),
        )
        .await
        {
            HandOff::Started(handle) => Delivery::HandedOff(handle),
            HandOff::DeadLettered => Delivery::DeadLettered,
            HandOff::Refused => Delivery::Refused,
        }
    }

    /// Drain one batch from the event bus. Settled events are acknowledged;
    /// refused events that no dead-letter queue took are left for redelivery.
    pub async fn poll_once(&self) -> Result<Vec<Delivery>> {
        let batch = self.events.receive(DEFAULT_BATCH_SIZE).await?;
        let mut deliveries = Vec::with_capacity(batch.len());
        let mut settled = Vec::with_capacity(batch.len());
        for message in batch {
            let delivery = self.deliver(message.body.clone()).await;
            if delivery.is_settled() {
                settled.push(message);
            }
            deliveries.push(delivery);
        }
        if !settled.is_empty() {
            self.events.ack(&settled).await?;
        }
        Ok(deliveries)
    }

    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        info!(
            bucket = self.rule.bucket(),
            bus = self.events.name(),
            workflow = self.workflow.name(),
            "storage event trigger started"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(deliveries) => deliveries.is_empty(),
                Err(e) => {
                    error!(bus = self.events.name(), error = %e, "event poll failed");
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

        info!(bucket = self.rule.bucket(), "storage event trigger stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_only_its_bucket_and_event_type() {
        let rule = ObjectCreatedRule::new("uploads");
        assert!(rule.matches(&object_created_event("uploads", "a.csv")));
        assert!(!rule.matches(&object_created_event("other", "a.csv")));

        let mut deleted = object_created_event("uploads", "a.csv");
        deleted["detail-type"] = json!("Object Deleted");
        assert!(!rule.matches(&deleted));

        let mut foreign = object_created_event("uploads", "a.csv");
        foreign["source"] = json!("custom.app");
        assert!(!rule.matches(&foreign));

        assert!(!rule.matches(&json!({})));
    }
}
