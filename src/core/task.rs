//! Task data model for refresh runs.
//!
//! Tasks are the atomic units of work in a run. Each task has a unique
//! name, a `required` flag deciding whether its failure aborts the run,
//! and an opaque action that mutates shared storage when invoked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique name of a task within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which stage of a run a task belongs to.
///
/// Every ingestion task reaches a terminal state before any
/// transformation task starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Pulls raw records from the external API into staging storage.
    Ingestion,
    /// Derives tables from what is currently in storage.
    Transformation,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Ingestion => write!(f, "ingestion"),
            TaskKind::Transformation => write!(f, "transformation"),
        }
    }
}

/// What an action reports back: exit code 0 means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ActionOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The side-effecting body of a task.
///
/// Invocation blocks the caller until the work is done. Failures are
/// reported through the exit code, never by panicking or by `Err`.
pub trait TaskAction: Send + Sync {
    fn invoke(&self) -> ActionOutput;

    /// Executable this action needs on `PATH`, if any.
    fn program(&self) -> Option<&str> {
        None
    }

    /// Whether the action can run on this machine.
    fn is_available(&self) -> bool {
        true
    }

    /// Short human-readable description, used by `plan`.
    fn describe(&self) -> String {
        "<action>".to_string()
    }
}

/// Result of a single task invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    pub fn from_output(output: ActionOutput, duration: Duration) -> Self {
        Self {
            success: output.is_success(),
            exit_code: output.exit_code,
            duration,
            stdout: output.stdout,
            stderr: output.stderr,
            finished_at: Utc::now(),
        }
    }
}

/// A registered unit of work. Identity is the name.
#[derive(Clone)]
pub struct Task {
    pub name: TaskName,
    pub kind: TaskKind,
    pub required: bool,
    action: Arc<dyn TaskAction>,
}

impl Task {
    pub fn new(
        name: impl Into<TaskName>,
        kind: TaskKind,
        required: bool,
        action: Arc<dyn TaskAction>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            required,
            action,
        }
    }

    /// An ingestion task; `required` decides the failure policy.
    pub fn ingestion(
        name: impl Into<TaskName>,
        required: bool,
        action: Arc<dyn TaskAction>,
    ) -> Self {
        Self::new(name, TaskKind::Ingestion, required, action)
    }

    /// A transformation task. Transformations are always required.
    pub fn transformation(name: impl Into<TaskName>, action: Arc<dyn TaskAction>) -> Self {
        Self::new(name, TaskKind::Transformation, true, action)
    }

    pub fn action(&self) -> &Arc<dyn TaskAction> {
        &self.action
    }

    /// Run the action to completion and time it.
    pub fn invoke(&self) -> Outcome {
        let started = Instant::now();
        let output = self.action.invoke();
        Outcome::from_output(output, started.elapsed())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("action", &self.action.describe())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Task {}
