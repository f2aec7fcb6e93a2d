//! Pub/sub topic notifier.
//!
//! A notice is published to a named topic together with the topic's email
//! subscribers; delivery to those subscribers is the transport's job.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use super::{FailureNotice, Notifier};
use crate::error::Result;

/// Something that can publish a JSON message to a topic.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &serde_json::Value) -> Result<()>;
}

pub struct TopicNotifier {
    topic: String,
    subscribers: Vec<String>,
    publisher: Arc<dyn TopicPublisher>,
}

impl TopicNotifier {
    pub fn new(topic: impl Into<String>, publisher: Arc<dyn TopicPublisher>) -> Self {
        Self {
            topic: topic.into(),
            subscribers: Vec::new(),
            publisher,
        }
    }

    /// Add an email subscription to the topic.
    pub fn subscribe_email(mut self, email: impl Into<String>) -> Self {
        self.subscribers.push(email.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribers(&self) -> &[String] {
        &self.subscribers
    }
}

#[async_trait]
impl Notifier for TopicNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        let message = json!({
            "topic": self.topic,
            "subscribers": self.subscribers,
            "notice": notice,
        });
        self.publisher.publish(&self.topic, &message).await?;
        info!(
            topic = %self.topic,
            run_id = %notice.run_id,
            subscribers = self.subscribers.len(),
            "failure notice published"
        );
        Ok(())
    }
}

/// In-process topic that keeps everything published to it.
#[derive(Debug, Default)]
pub struct MemoryTopic {
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, as `(topic, message)` pairs.
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl TopicPublisher for MemoryTopic {
    async fn publish(&self, topic: &str, message: &serde_json::Value) -> Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkUnit, WorkflowRun};
    use crate::notify::FAILURE_MESSAGE;

    #[tokio::test]
    async fn notice_is_published_with_subscribers() {
        let topic = Arc::new(MemoryTopic::new());
        let notifier =
            TopicNotifier::new("ops-alerts", topic.clone()).subscribe_email("ops@example.com");

        let mut run = WorkflowRun::new("ticker", WorkUnit::empty());
        run.key = Some("job-42".to_string());
        notifier
            .notify(&FailureNotice::for_run(&run))
            .await
            .unwrap();

        let published = topic.published();
        assert_eq!(published.len(), 1);
        let (name, message) = &published[0];
        assert_eq!(name, "ops-alerts");
        assert_eq!(message["subscribers"][0], "ops@example.com");
        assert_eq!(message["notice"]["message"], FAILURE_MESSAGE);
        assert_eq!(message["notice"]["key"], "job-42");
    }
}
