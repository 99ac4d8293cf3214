//! Core domain models for refresh runs.
//!
//! This module contains the fundamental data structures: tasks, the
//! registry that orders them, and the record of a run.

pub mod registry;
pub mod run;
pub mod task;

pub use registry::{EdgeKind, TaskRegistry};
pub use run::{Run, RunId, RunStatus, TaskRecord, TriggerKind};
pub use task::{ActionOutput, Outcome, Task, TaskAction, TaskKind, TaskName};
