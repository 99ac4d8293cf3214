//! Run data model.
//!
//! A run is one sequential execution of the registry's topological order.
//! It records every invoked task with its outcome, in invocation order.

use crate::core::task::{Outcome, Task, TaskName};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every task ran; optional failures may have been tolerated.
    Succeeded,
    /// The run could not be planned or executed at all.
    Failed,
    /// A required task failed and the remaining tasks were skipped.
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// What fired a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Scheduled => write!(f, "scheduled"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// One invoked task and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskName,
    pub required: bool,
    pub outcome: Outcome,
}

impl TaskRecord {
    pub fn new(task: &Task, outcome: Outcome) -> Self {
        Self {
            task: task.name.clone(),
            required: task.required,
            outcome,
        }
    }

    /// Failed, but the failure did not stop the run.
    pub fn is_tolerated_failure(&self) -> bool {
        !self.required && !self.outcome.success
    }
}

/// One execution of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records: Vec<TaskRecord>,
    /// Diagnostic for `Failed` runs.
    pub error: Option<String>,
}

impl Run {
    /// Create a run in the `Running` state.
    pub fn start(id: RunId, trigger: TriggerKind) -> Self {
        Self {
            id,
            trigger,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            records: Vec::new(),
            error: None,
        }
    }

    /// A run that could not complete; it carries no task records.
    pub fn failed(id: RunId, trigger: TriggerKind, error: impl Into<String>) -> Self {
        let mut run = Self::start(id, trigger);
        run.error = Some(error.into());
        run.finish(RunStatus::Failed);
        run
    }

    pub fn record(&mut self, record: TaskRecord) {
        self.records.push(record);
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Names of the invoked tasks, in invocation order.
    pub fn task_names(&self) -> Vec<&TaskName> {
        self.records.iter().map(|r| &r.task).collect()
    }

    /// Optional tasks that failed without stopping the run.
    pub fn tolerated_failures(&self) -> Vec<&TaskRecord> {
        self.records
            .iter()
            .filter(|r| r.is_tolerated_failure())
            .collect()
    }

    /// The required task that aborted this run.
    pub fn aborted_by(&self) -> Option<&TaskRecord> {
        if self.status != RunStatus::Aborted {
            return None;
        }
        self.records.last()
    }

    /// Escalate an aborted run to `RequiredTaskFailed`.
    pub fn into_result(self) -> Result<Run> {
        match self.status {
            RunStatus::Aborted => {
                let (name, stderr) = self
                    .aborted_by()
                    .map(|r| (r.task.clone(), r.outcome.stderr.clone()))
                    .unwrap_or_else(|| (TaskName::from("<unknown>"), String::new()));
                Err(Error::RequiredTaskFailed { name, stderr })
            }
            RunStatus::Failed => Err(Error::Validation(
                self.error.unwrap_or_else(|| "run failed".to_string()),
            )),
            _ => Ok(self),
        }
    }
}
