//! Orchestration layer: task actions, the sequential run executor,
//! materialization sinks and the cadence scheduler.

pub mod actions;
pub mod executor;
pub mod materialization;
pub mod scheduler;

pub use actions::{CommandAction, FnAction};
pub use executor::{RunExecutor, RunSteps};
pub use materialization::{
    FanoutSink, JsonLinesSink, LogSink, MaterializationRecord, MaterializationSink, MemorySink,
};
pub use scheduler::{
    Cadence, ScheduleHandle, ScheduleStatus, Scheduler, SchedulerEvent, TriggerResult,
};
