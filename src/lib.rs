pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod util;

pub use crate::core::{Run, RunId, RunStatus, Task, TaskName, TaskRegistry, TriggerKind};
pub use error::{Error, Result};
