//! Scheduler: fires runs on a cron cadence or on demand.
//!
//! State machine: `Idle -> Triggered -> Running -> Idle`. A trigger only
//! becomes a run when the single admission slot is empty; a trigger that
//! arrives while a run is active is dropped, not queued, and the next
//! cadence tick tries again. This is what keeps two runs from ever writing
//! to storage at the same time.
//!
//! The slot is a `tokio::sync::watch` channel holding the active run id.
//! Admission is a check-and-set under the channel's lock, and waiting for
//! `Idle` is a `wait_for` on a receiver.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::registry::TaskRegistry;
use crate::core::run::{Run, RunId, RunStatus, TriggerKind};
use crate::core::task::TaskName;
use crate::orchestration::executor::RunExecutor;
use crate::util::blocking;
use crate::{flog, flog_debug, flog_error, flog_trace, Error, Result};

/// Most recent runs kept in memory.
const HISTORY_LIMIT: usize = 32;

/// A parsed cron cadence, evaluated in UTC.
///
/// Accepts the standard 5-field form (`*/15 * * * *`, seconds taken as 0)
/// as well as the 6/7-field form with a leading seconds field.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    schedule: cron::Schedule,
}

impl Cadence {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::InvalidSchedule(format!("{}: {}", expression, e)))?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Next fire time for a loop that last fired at `last_fired`.
    ///
    /// Never returns `last_fired` or anything before it, even if the wall
    /// clock has stepped backwards since.
    pub fn next_fire(
        &self,
        now: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let from = match last_fired {
            Some(last) if last > now => last,
            _ => now,
        };
        self.next_after(from)
    }
}

/// Answer to a trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    /// A new run was admitted and is executing.
    Started(RunId),
    /// A run was already active; the trigger was dropped.
    Rejected,
}

/// Snapshot of the schedule for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub cron: String,
    pub enabled: bool,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub active_run: Option<RunId>,
}

/// Events emitted by the scheduler for run lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    RunStarted {
        run_id: RunId,
        trigger: TriggerKind,
    },
    TaskFinished {
        run_id: RunId,
        task: TaskName,
        success: bool,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
    /// A trigger arrived while `active` was running.
    TriggerDropped {
        trigger: TriggerKind,
        active: RunId,
    },
}

/// Clears the admission slot when dropped, including on panic.
struct SlotGuard<'a> {
    slot: &'a watch::Sender<Option<RunId>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.send_replace(None);
    }
}

/// Fires runs of a fixed registry, never more than one at a time.
///
/// ```ignore
/// let scheduler = Arc::new(Scheduler::new(registry, RunExecutor::default(), cadence));
/// let handle = scheduler.spawn();
/// match scheduler.trigger(TriggerKind::Manual) {
///     TriggerResult::Started(id) => println!("run {}", id),
///     TriggerResult::Rejected => println!("busy"),
/// }
/// handle.stop().await;
/// ```
pub struct Scheduler {
    registry: TaskRegistry,
    executor: RunExecutor,
    cadence: Cadence,
    enabled: AtomicBool,
    active: watch::Sender<Option<RunId>>,
    history: Mutex<VecDeque<Run>>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    /// Create an enabled scheduler. The registry is fixed from here on.
    pub fn new(registry: TaskRegistry, executor: RunExecutor, cadence: Cadence) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            registry,
            executor,
            cadence,
            enabled: AtomicBool::new(true),
            active,
            history: Mutex::new(VecDeque::new()),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn set_enabled(&self, enabled: bool) {
        flog!("Schedule {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn active_run(&self) -> Option<RunId> {
        *self.active.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.active_run().is_some()
    }

    pub fn schedule_status(&self) -> ScheduleStatus {
        let enabled = self.is_enabled();
        ScheduleStatus {
            cron: self.cadence.expression().to_string(),
            enabled,
            next_fire_time: if enabled {
                self.cadence.next_after(Utc::now())
            } else {
                None
            },
            active_run: self.active_run(),
        }
    }

    /// Most recent finished run.
    pub fn last_run(&self) -> Option<Run> {
        self.history.lock().ok()?.back().cloned()
    }

    /// Finished runs, oldest first.
    pub fn history(&self) -> Vec<Run> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Claim the admission slot for a new run, or report who holds it.
    fn admit(&self, trigger: TriggerKind) -> std::result::Result<RunId, RunId> {
        let id = RunId::new();
        let mut holder = None;
        self.active.send_if_modified(|slot| match slot {
            Some(active) => {
                holder = Some(*active);
                false
            }
            None => {
                *slot = Some(id);
                true
            }
        });

        match holder {
            Some(active) => {
                flog_debug!(
                    "Dropping {} trigger: run {} is active",
                    trigger,
                    active.short()
                );
                self.emit(SchedulerEvent::TriggerDropped { trigger, active });
                Err(active)
            }
            None => Ok(id),
        }
    }

    /// Execute an admitted run on the current thread and release the slot.
    fn run_admitted(&self, id: RunId, trigger: TriggerKind) -> Run {
        let _guard = SlotGuard { slot: &self.active };

        self.emit(SchedulerEvent::RunStarted {
            run_id: id,
            trigger,
        });

        let plan = self.registry.plan();
        let executed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor
                .execute_run(Run::start(id, trigger), &plan, |record| {
                    self.emit(SchedulerEvent::TaskFinished {
                        run_id: id,
                        task: record.task.clone(),
                        success: record.outcome.success,
                    });
                })
        }));

        // Recorded while the slot is still held, so an idle scheduler
        // always has the run in its history.
        let run = match executed {
            Ok(run) => run,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                flog_error!("Run {} panicked: {}", id.short(), reason);
                Run::failed(id, trigger, format!("run panicked: {}", reason))
            }
        };
        self.finish(run.clone());
        run
    }

    fn finish(&self, run: Run) {
        let (run_id, status) = (run.id, run.status);
        if let Ok(mut history) = self.history.lock() {
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(run);
        }
        self.emit(SchedulerEvent::RunFinished { run_id, status });
    }

    /// Run once on the calling thread, blocking until the run ends.
    ///
    /// # Errors
    /// `SchedulerBusy` if a run is already active.
    pub fn run_now(&self, trigger: TriggerKind) -> Result<Run> {
        let id = self.admit(trigger).map_err(|_| Error::SchedulerBusy)?;
        Ok(self.run_admitted(id, trigger))
    }

    /// Start a run in the background if none is active.
    ///
    /// Must be called from within a tokio runtime. The run executes on the
    /// blocking pool; task actions block that thread, not the runtime.
    pub fn trigger(self: &Arc<Self>, trigger: TriggerKind) -> TriggerResult {
        let id = match self.admit(trigger) {
            Ok(id) => id,
            Err(_) => return TriggerResult::Rejected,
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let worker = Arc::clone(&this);
            let result = blocking(move || Ok(worker.run_admitted(id, trigger))).await;
            if let Err(e) = result {
                // The blocking pool dropped the worker before it ran.
                flog_error!("Run {} did not complete: {}", id.short(), e);
                this.finish(Run::failed(id, trigger, e.to_string()));
            }
        });

        TriggerResult::Started(id)
    }

    /// Wait until no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|slot| slot.is_none()).await;
    }

    /// Start the cadence loop as a background task.
    pub fn spawn(self: &Arc<Self>) -> ScheduleHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = Arc::clone(self);

        flog_debug!("Scheduler::spawn cron={}", this.cadence.expression());

        let join = tokio::spawn(async move {
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = Utc::now();
                let Some(next) = this.cadence.next_fire(now, last_fired) else {
                    flog!("Schedule {} has no future fire times", this.cadence.expression());
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                flog_trace!("Next tick at {} (in {:?})", next, wait);

                tokio::select! {
                    _ = token.cancelled() => {
                        flog_debug!("Schedule loop cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        last_fired = Some(next);
                        if !this.is_enabled() {
                            flog_trace!("Tick at {} skipped: schedule disabled", next);
                            continue;
                        }
                        if let TriggerResult::Started(id) = this.trigger(TriggerKind::Scheduled) {
                            flog_debug!("Tick at {} started run {}", next, id.short());
                        }
                    }
                }
            }
        });

        ScheduleHandle {
            cancel,
            join,
            scheduler: Arc::clone(self),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cron", &self.cadence.expression())
            .field("enabled", &self.is_enabled())
            .field("active_run", &self.active_run())
            .finish()
    }
}

/// Handle to a running cadence loop, used for graceful shutdown.
pub struct ScheduleHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    scheduler: Arc<Scheduler>,
}

impl ScheduleHandle {
    /// Signal the loop to stop firing new runs.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the loop and wait for an in-flight run to finish.
    ///
    /// Runs are not cancellable mid-flight.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
        self.scheduler.wait_idle().await;
    }
}
