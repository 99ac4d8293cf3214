//! Admission and cadence tests.
//!
//! These tests verify that at most one run is active at any instant,
//! that triggers arriving during a run are dropped rather than queued,
//! and that the cadence loop shuts down cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use floodgate::core::task::{ActionOutput, TaskAction};
use floodgate::orchestration::{
    Cadence, FnAction, RunExecutor, Scheduler, SchedulerEvent, TriggerResult,
};
use floodgate::{Error, RunStatus, Task, TaskRegistry, TriggerKind};

use crate::fixtures::{gated_action, memory_executor, CallLog, Script};

fn gated_registry(log: &CallLog, script: &Script) -> (TaskRegistry, std::sync::mpsc::Sender<()>) {
    let (gated, release) = gated_action(log, "raw_readings");
    let mut registry = TaskRegistry::new();
    registry
        .register(Task::ingestion("raw_readings", true, gated), &[])
        .unwrap();
    registry
        .register(Task::transformation("build", script.action("build")), &[])
        .unwrap();
    (registry, release)
}

/// Test: Two triggers during an active run are rejected
/// Given a run is in progress
/// When two more triggers arrive
/// Then both are rejected and exactly one run executes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_triggers_are_dropped() {
    let log = CallLog::new();
    let script = Script::new(&[]);
    let (registry, release) = gated_registry(&log, &script);
    let (executor, sink) = memory_executor();
    let scheduler = Arc::new(Scheduler::new(
        registry,
        executor,
        Cadence::parse("*/15 * * * *").unwrap(),
    ));

    let TriggerResult::Started(id) = scheduler.trigger(TriggerKind::Scheduled) else {
        panic!("first trigger should start a run");
    };
    assert!(scheduler.is_running());
    assert_eq!(scheduler.schedule_status().active_run, Some(id));

    assert_eq!(
        scheduler.trigger(TriggerKind::Scheduled),
        TriggerResult::Rejected
    );
    assert_eq!(
        scheduler.trigger(TriggerKind::Manual),
        TriggerResult::Rejected
    );

    release.send(()).unwrap();
    scheduler.wait_idle().await;

    assert_eq!(log.calls(), vec!["raw_readings"]);
    assert_eq!(script.log.calls(), vec!["build"]);
    assert_eq!(scheduler.history().len(), 1);
    assert_eq!(scheduler.last_run().unwrap().status, RunStatus::Succeeded);
    assert!(sink.records().iter().all(|r| r.run_id == id));
}

/// Test: Blocking run_now reports busy while a background run is active
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_now_busy_then_available() {
    let log = CallLog::new();
    let script = Script::new(&[]);
    let (registry, release) = gated_registry(&log, &script);
    let (executor, _sink) = memory_executor();
    let scheduler = Arc::new(Scheduler::new(
        registry,
        executor,
        Cadence::parse("*/15 * * * *").unwrap(),
    ));

    assert!(matches!(
        scheduler.trigger(TriggerKind::Manual),
        TriggerResult::Started(_)
    ));
    assert!(matches!(
        scheduler.run_now(TriggerKind::Manual),
        Err(Error::SchedulerBusy)
    ));

    release.send(()).unwrap();
    scheduler.wait_idle().await;

    // The gate is a single-use channel; the next run needs another release.
    release.send(()).unwrap();
    let this = Arc::clone(&scheduler);
    let run = tokio::task::spawn_blocking(move || this.run_now(TriggerKind::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(scheduler.history().len(), 2);
}

/// Test: A panicking action yields a failed run and frees the slot
/// Given a run whose only task panics
/// When the scheduler reports idle
/// Then the failed run is already in history, ahead of any later run
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_panic_records_failed_run() {
    let action: Arc<dyn TaskAction> = Arc::new(FnAction::new("explodes", || -> ActionOutput {
        panic!("storage file is corrupt")
    }));
    let mut registry = TaskRegistry::new();
    registry
        .register(Task::ingestion("raw_readings", true, action), &[])
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(
        Scheduler::new(
            registry,
            RunExecutor::default(),
            Cadence::parse("*/15 * * * *").unwrap(),
        )
        .with_events(tx),
    );

    let TriggerResult::Started(id) = scheduler.trigger(TriggerKind::Manual) else {
        panic!("expected a run");
    };
    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
        .await
        .unwrap();

    let last = scheduler.last_run().unwrap();
    assert_eq!(last.id, id);
    assert_eq!(last.status, RunStatus::Failed);
    assert!(last.error.unwrap().contains("storage file is corrupt"));

    let TriggerResult::Started(second) = scheduler.trigger(TriggerKind::Manual) else {
        panic!("slot should be free after a failed run");
    };
    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
        .await
        .unwrap();
    let ids: Vec<_> = scheduler.history().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![id, second]);

    let mut finished = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::RunFinished { run_id, status } = event {
            finished.push((run_id, status));
        }
    }
    assert_eq!(
        finished,
        vec![(id, RunStatus::Failed), (second, RunStatus::Failed)]
    );
}

/// Test: Scheduled ticks during a long run are dropped
/// Given a manual run that outlasts several one-second ticks
/// When the cadence loop fires
/// Then every tick is reported as dropped and only one run is active
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cadence_ticks_dropped_while_running() {
    let log = CallLog::new();
    let script = Script::new(&[]);
    let (registry, release) = gated_registry(&log, &script);
    let (executor, _sink) = memory_executor();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(
        Scheduler::new(registry, executor, Cadence::parse("* * * * * *").unwrap())
            .with_events(tx),
    );

    let TriggerResult::Started(manual) = scheduler.trigger(TriggerKind::Manual) else {
        panic!("expected a run");
    };
    let handle = scheduler.spawn();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(scheduler.active_run(), Some(manual));

    handle.shutdown();
    assert!(handle.is_cancelled());
    release.send(()).unwrap();
    handle.stop().await;

    let mut dropped = 0;
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::TriggerDropped { trigger, active } = event {
            assert_eq!(trigger, TriggerKind::Scheduled);
            assert_eq!(active, manual);
            dropped += 1;
        }
    }
    assert!(dropped >= 1, "expected at least one dropped tick");

    let history = scheduler.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, manual);
    assert!(!scheduler.is_running());
}
