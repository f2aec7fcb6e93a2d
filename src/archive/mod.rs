//! Run history. Terminal runs are archived here for operators to inspect.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::model::{RunId, State, WorkflowRun};

/// Filters for listing archived runs.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub state: Option<State>,
    pub workflow: Option<String>,
    /// Drop failures that are expected noise (duplicate admissions).
    pub alertable_only: bool,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            state: None,
            workflow: None,
            alertable_only: false,
            limit: 20,
        }
    }
}

impl RunFilter {
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.state.is_none_or(|s| run.state == s)
            && self.workflow.as_deref().is_none_or(|w| run.workflow == w)
            && (!self.alertable_only || run.is_alertable_failure())
    }
}

#[async_trait]
pub trait RunArchive: Send + Sync {
    async fn archive(&self, run: &WorkflowRun) -> Result<()>;

    async fn get(&self, id: RunId) -> Result<WorkflowRun>;

    /// Most recently started first.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>>;
}

#[derive(Debug, Default)]
pub struct MemoryRunArchive {
    runs: RwLock<Vec<WorkflowRun>>,
}

impl MemoryRunArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunArchive for MemoryRunArchive {
    async fn archive(&self, run: &WorkflowRun) -> Result<()> {
        let mut runs = self.runs.write();
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<WorkflowRun> {
        self.runs
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(filter.limit);
        Ok(runs)
    }
}
