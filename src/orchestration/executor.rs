//! Run executor: invokes the tasks of one run strictly one at a time.
//!
//! The backing store allows a single writer, so the executor never runs
//! two actions concurrently, even when they share no dependency edge.
//! After each invocation it applies the failure policy:
//!
//! - a failed required task aborts the run; nothing after it is invoked
//! - a failed optional task is logged at WARN and the run moves on to the
//!   next task, which works against whatever data storage already holds

use std::sync::Arc;

use crate::core::run::{Run, RunId, RunStatus, TaskRecord, TriggerKind};
use crate::core::task::{Outcome, Task};
use crate::orchestration::materialization::{
    LogSink, MaterializationRecord, MaterializationSink,
};
use crate::log::{self, LogLevel};
use crate::{flog, flog_debug};

/// Lazily invokes tasks in the given order, one per `next()`.
///
/// Nothing is invoked until pulled, so a consumer that stops iterating
/// guarantees the remaining actions never run.
pub struct RunSteps<'a> {
    tasks: std::slice::Iter<'a, Task>,
}

impl<'a> RunSteps<'a> {
    pub fn new(order: &'a [Task]) -> Self {
        Self {
            tasks: order.iter(),
        }
    }
}

impl<'a> Iterator for RunSteps<'a> {
    type Item = (&'a Task, Outcome);

    fn next(&mut self) -> Option<Self::Item> {
        let task = self.tasks.next()?;
        flog_debug!("RunSteps: invoking {} ({})", task.name, task.kind);
        let outcome = task.invoke();
        Some((task, outcome))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.tasks.size_hint()
    }
}

/// Executes runs against a materialization sink.
pub struct RunExecutor {
    sink: Arc<dyn MaterializationSink>,
}

impl RunExecutor {
    pub fn new(sink: Arc<dyn MaterializationSink>) -> Self {
        Self { sink }
    }

    /// Execute `order` as a fresh manually-triggered run.
    ///
    /// The returned run is `Succeeded` or `Aborted`; use
    /// [`Run::into_result`] to escalate an abort to `RequiredTaskFailed`.
    pub fn execute(&self, order: &[Task]) -> Run {
        self.execute_run(Run::start(RunId::new(), TriggerKind::Manual), order, |_| {})
    }

    /// Execute `order` into an already-started run.
    ///
    /// `observer` sees each task record right after it is appended.
    pub fn execute_run<F>(&self, mut run: Run, order: &[Task], mut observer: F) -> Run
    where
        F: FnMut(&TaskRecord),
    {
        run.status = RunStatus::Running;
        flog!(
            "Run {} started ({}, {} tasks)",
            run.id.short(),
            run.trigger,
            order.len()
        );

        for (task, outcome) in RunSteps::new(order) {
            if !outcome.stdout.is_empty() {
                flog!("[{}] {}", task.name, outcome.stdout);
            }

            let record = TaskRecord::new(task, outcome);
            self.sink
                .record(&MaterializationRecord::from_task_record(run.id, &record));
            observer(&record);

            let secs = record.outcome.duration.as_secs_f64();
            let failed = !record.outcome.success;
            let stderr = record.outcome.stderr.clone();
            run.record(record);

            if !failed {
                flog!("Task {} succeeded in {:.3}s", task.name, secs);
                continue;
            }

            for (level, line) in failure_log(task, secs, &stderr, run.id) {
                log::log_at(level, &line);
            }
            if task.required {
                run.finish(RunStatus::Aborted);
                return run;
            }
        }

        run.finish(RunStatus::Succeeded);
        flog!(
            "Run {} succeeded ({} tolerated failures)",
            run.id.short(),
            run.tolerated_failures().len()
        );
        run
    }
}

/// Log lines for a failed task: the policy decision, then its stderr.
///
/// Stderr is always logged at ERROR; a tolerated failure's decision line
/// is a WARN.
fn failure_log(task: &Task, secs: f64, stderr: &str, run_id: RunId) -> Vec<(LogLevel, String)> {
    let mut lines = Vec::with_capacity(2);
    if task.required {
        lines.push((
            LogLevel::Error,
            format!(
                "Required task {} failed after {:.3}s, aborting run {}",
                task.name,
                secs,
                run_id.short()
            ),
        ));
    } else {
        lines.push((
            LogLevel::Warn,
            format!(
                "Optional task {} failed after {:.3}s, continuing with existing data",
                task.name, secs
            ),
        ));
    }
    if !stderr.is_empty() {
        lines.push((LogLevel::Error, format!("[{}] {}", task.name, stderr)));
    }
    lines
}

impl Default for RunExecutor {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}
