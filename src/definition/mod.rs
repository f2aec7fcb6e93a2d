//! Workflow definitions and registry.
//!
//! One TOML file per workflow:
//!
//! ```toml
//! [workflow]
//! name = "nightly-report"
//! key_expression = "$.id"
//! timeout_secs = 900
//!
//! [workflow.executor]
//! kind = "command"
//! program = "/usr/local/bin/report"
//!
//! [workflow.notification]
//! topic = "report-failures"
//! emails = ["ops@example.com"]
//!
//! [[workflow.trigger]]
//! kind = "schedule"
//! cron = "0/5"
//! enabled = true
//! ```

pub mod backend;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{RetryPolicy, Workflow};
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, FunctionExecutor, JobExecutor};
use crate::key::KeyExpression;
use crate::notify::{LogNotifier, Notifier, TopicNotifier};
use crate::trigger::{
    CronMinute, ObjectCreatedRule, QueueTrigger, ScheduleTrigger, StorageEventTrigger, Trigger,
};

pub use backend::{Backend, MemoryBackend};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    workflow: WorkflowDefinition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub key_expression: Option<KeyExpression>,
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
    /// Upper bound for each attempt.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    /// Keep this workflow's keys in their own table.
    #[serde(default)]
    pub dedicated_store: bool,
    #[serde(default, rename = "trigger")]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Function {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationConfig {
    pub topic: String,
    #[serde(default)]
    pub emails: Vec<String>,
}

/// Fields left out keep the default policy's values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub interval_secs: Option<f64>,
    pub backoff_rate: Option<f64>,
    pub max_delay_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    Schedule {
        #[serde(default = "default_cron")]
        cron: String,
        #[serde(default)]
        enabled: bool,
        #[serde(default)]
        dead_letter_queue: Option<String>,
    },
    Queue {
        queue: String,
        #[serde(default)]
        batch_size: Option<usize>,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
    },
    StorageEvent {
        bucket: String,
        /// Queue the storage events arrive on.
        bus: String,
        #[serde(default)]
        dead_letter_queue: Option<String>,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
    },
}

fn default_cron() -> String {
    crate::trigger::schedule::DEFAULT_SCHEDULE.to_string()
}

impl RetryOverride {
    pub fn apply(&self, base: RetryPolicy) -> Result<RetryPolicy> {
        let secs = |field: &str, v: f64| {
            Duration::try_from_secs_f64(v)
                .map_err(|e| Error::Config(format!("retry {field} = {v}: {e}")))
        };
        Ok(RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            interval: match self.interval_secs {
                Some(v) => secs("interval_secs", v)?,
                None => base.interval,
            },
            backoff_rate: self.backoff_rate.unwrap_or(base.backoff_rate),
            max_delay: match self.max_delay_secs {
                Some(v) => Some(secs("max_delay_secs", v)?),
                None => base.max_delay,
            },
        })
    }
}

impl WorkflowDefinition {
    /// Parse a single definition from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: DefinitionFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad workflow definition: {e}")))?;
        Ok(file.workflow)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        match &self.retry {
            Some(o) => o.apply(RetryPolicy::default()),
            None => Ok(RetryPolicy::default()),
        }
    }

    pub fn executor(&self) -> Arc<dyn JobExecutor> {
        match &self.executor {
            ExecutorConfig::Command { program, args, env } => {
                let mut exec = CommandExecutor::new(program).args(args);
                for (k, v) in env {
                    exec = exec.env(k, v);
                }
                Arc::new(exec)
            }
            ExecutorConfig::Function { url } => Arc::new(FunctionExecutor::new(url)),
        }
    }

    /// Build the runnable workflow against `backend`.
    pub async fn build(&self, backend: &Backend, max_in_flight: usize) -> Result<Workflow> {
        let notifier: Arc<dyn Notifier> = match &self.notification {
            Some(n) => {
                backend.ensure_queue(&n.topic).await?;
                let topic = n
                    .emails
                    .iter()
                    .fold(TopicNotifier::new(&n.topic, backend.publisher()), |t, email| {
                        t.subscribe_email(email)
                    });
                Arc::new(topic)
            }
            None => Arc::new(LogNotifier),
        };

        let mut builder = Workflow::builder(&self.name)
            .shared_executor(self.executor())
            .store(backend.store(&self.name, self.dedicated_store).await?)
            .notifier(notifier)
            .archive(backend.archive())
            .retry(self.retry_policy()?)
            .max_in_flight(max_in_flight);
        if let Some(key) = &self.key_expression {
            builder = builder.key_expression(key.as_str());
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    /// Build this definition's triggers for an already-built workflow.
    pub async fn triggers(&self, workflow: &Workflow, backend: &Backend) -> Result<Vec<Trigger>> {
        let mut out = Vec::with_capacity(self.triggers.len());
        for (i, config) in self.triggers.iter().enumerate() {
            let trigger = match config {
                TriggerConfig::Schedule {
                    cron,
                    enabled,
                    dead_letter_queue,
                } => {
                    let name = format!("{}-schedule-{i}", self.name);
                    let cron = CronMinute::parse(cron)?;
                    let mut t =
                        ScheduleTrigger::new(name, cron, workflow.clone()).enabled(*enabled);
                    if let Some(dlq) = dead_letter_queue {
                        backend.ensure_queue(dlq).await?;
                        t = t.dead_letters(backend.dead_letters(dlq));
                    }
                    Trigger::Schedule(t)
                }
                TriggerConfig::Queue {
                    queue,
                    batch_size,
                    poll_interval_secs,
                } => {
                    backend.ensure_queue(queue).await?;
                    let mut t = QueueTrigger::new(backend.source(queue), workflow.clone());
                    if let Some(n) = batch_size {
                        t = t.batch_size(*n);
                    }
                    if let Some(secs) = poll_interval_secs {
                        t = t.poll_interval(Duration::from_secs(*secs));
                    }
                    Trigger::Queue(t)
                }
                TriggerConfig::StorageEvent {
                    bucket,
                    bus,
                    dead_letter_queue,
                    poll_interval_secs,
                } => {
                    backend.ensure_queue(bus).await?;
                    let mut t = StorageEventTrigger::new(
                        ObjectCreatedRule::new(bucket),
                        backend.source(bus),
                        workflow.clone(),
                    );
                    if let Some(dlq) = dead_letter_queue {
                        backend.ensure_queue(dlq).await?;
                        t = t.dead_letters(backend.dead_letters(dlq));
                    }
                    if let Some(secs) = poll_interval_secs {
                        t = t.poll_interval(Duration::from_secs(*secs));
                    }
                    Trigger::StorageEvent(t)
                }
            };
            out.push(trigger);
        }
        Ok(out)
    }
}

/// Registry of loaded workflow definitions, indexed by name.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, WorkflowDefinition>,
}

impl DefinitionRegistry {
    /// Create an empty registry with no definitions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory. Duplicate names are an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read workflow dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let definition = WorkflowDefinition::from_toml(&content)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                registry.insert(definition)?;
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<()> {
        if self.definitions.contains_key(&definition.name) {
            return Err(Error::Config(format!(
                "workflow {} is defined more than once",
                definition.name
            )));
        }
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
