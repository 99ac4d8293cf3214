use thiserror::Error;

use crate::core::task::TaskName;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskName),

    #[error("Task not registered: {0}")]
    UnknownTask(TaskName),

    #[error("Dependency from {upstream} to {downstream} would create a cycle")]
    Cycle {
        upstream: TaskName,
        downstream: TaskName,
    },

    #[error("Required task {name} failed: {stderr}")]
    RequiredTaskFailed { name: TaskName, stderr: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("A run is already in progress")]
    SchedulerBusy,

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
