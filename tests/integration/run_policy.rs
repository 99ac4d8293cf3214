//! Failure policy and ordering tests.
//!
//! These tests verify that a required failure aborts the run before any
//! later task is invoked, that optional failures are tolerated, and that
//! transformations always wait for the whole ingestion stage.

use std::sync::Arc;

use floodgate::core::registry::EdgeKind;
use floodgate::{Error, RunStatus, Task, TaskName, TaskRegistry, TriggerKind};

use crate::fixtures::{names, readings_registry, scheduler_for, Script};

/// Test: Optional ingestion failure is tolerated
/// Given raw_stations (optional) fails
/// When a run executes
/// Then every task is invoked in registration order and the run succeeds
#[test]
fn test_optional_failure_continues_to_transformation() {
    let script = Script::new(&["raw_stations"]);
    let (scheduler, sink) = scheduler_for(readings_registry(&script));

    let run = scheduler.run_now(TriggerKind::Scheduled).unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        script.log.calls(),
        vec!["raw_readings", "raw_stations", "raw_measures", "build"]
    );
    assert_eq!(
        names(&run.task_names()),
        vec!["raw_readings", "raw_stations", "raw_measures", "build"]
    );

    let tolerated = run.tolerated_failures();
    assert_eq!(tolerated.len(), 1);
    assert_eq!(tolerated[0].task, TaskName::from("raw_stations"));
    assert!(tolerated[0].outcome.stderr.contains("503"));

    let records = sink.records();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.run_id == run.id));
    assert!(!records[1].success);
    assert!(!records[1].required);
}

/// Test: Required ingestion failure aborts the run
/// Given raw_readings (required) fails
/// When a run executes
/// Then nothing after raw_readings is invoked and the run is aborted
#[test]
fn test_required_failure_aborts_before_anything_else() {
    let script = Script::new(&["raw_readings"]);
    let (scheduler, sink) = scheduler_for(readings_registry(&script));

    let run = scheduler.run_now(TriggerKind::Scheduled).unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(script.log.calls(), vec!["raw_readings"]);
    assert_eq!(names(&run.task_names()), vec!["raw_readings"]);
    assert_eq!(
        run.aborted_by().map(|r| r.task.clone()),
        Some(TaskName::from("raw_readings"))
    );
    assert_eq!(sink.records().len(), 1);

    match run.into_result() {
        Err(Error::RequiredTaskFailed { name, stderr }) => {
            assert_eq!(name, TaskName::from("raw_readings"));
            assert!(stderr.contains("503"));
        }
        other => panic!("expected RequiredTaskFailed, got {:?}", other),
    }
}

/// Test: A failed transformation aborts the run
#[test]
fn test_transformation_failure_aborts() {
    let script = Script::new(&["build"]);
    let (scheduler, _sink) = scheduler_for(readings_registry(&script));

    let run = scheduler.run_now(TriggerKind::Manual).unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(script.log.calls().len(), 4);
    assert!(run.into_result().is_err());
}

/// Test: Every optional ingestion fails
/// Given all optional sources fail
/// When a run executes
/// Then the transformation still runs against existing data
#[test]
fn test_all_optional_failures_still_build() {
    let script = Script::new(&["raw_stations", "raw_measures"]);
    let (scheduler, _sink) = scheduler_for(readings_registry(&script));

    let run = scheduler.run_now(TriggerKind::Manual).unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.tolerated_failures().len(), 2);
    assert_eq!(script.log.calls().last().map(String::as_str), Some("build"));
    assert!(run.into_result().is_ok());
}

/// Test: Stage barrier holds regardless of registration order
/// Given a transformation registered before an ingestion task
/// When the plan is computed
/// Then the ingestion task still comes first
#[test]
fn test_stage_barrier_with_interleaved_registration() {
    let script = Script::new(&[]);
    let mut registry = TaskRegistry::new();
    registry
        .register(Task::transformation("stg", script.action("stg")), &[])
        .unwrap();
    registry
        .register(Task::ingestion("raw", false, script.action("raw")), &[])
        .unwrap();
    registry
        .register(
            Task::transformation("fct", script.action("fct")),
            &[TaskName::from("stg")],
        )
        .unwrap();

    assert_eq!(
        registry.edge(&TaskName::from("raw"), &TaskName::from("stg")),
        Some(EdgeKind::StageBarrier)
    );

    let (scheduler, _sink) = scheduler_for(registry);
    scheduler.run_now(TriggerKind::Manual).unwrap();
    assert_eq!(script.log.calls(), vec!["raw", "stg", "fct"]);
}

/// Test: Rejected dependency leaves the plan unchanged
#[test]
fn test_cycle_rejection_keeps_plan() {
    let script = Script::new(&[]);
    let mut registry = TaskRegistry::new();
    registry
        .register(Task::transformation("a", script.action("a")), &[])
        .unwrap();
    registry
        .register(
            Task::transformation("b", script.action("b")),
            &[TaskName::from("a")],
        )
        .unwrap();

    let before: Vec<String> = registry
        .topological_order()
        .iter()
        .map(|t| t.name.to_string())
        .collect();
    let err = registry
        .add_dependency(&TaskName::from("b"), &TaskName::from("a"))
        .unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));

    let after: Vec<String> = registry
        .topological_order()
        .iter()
        .map(|t| t.name.to_string())
        .collect();
    assert_eq!(before, after);
    assert_eq!(registry.edge_count(), 1);
}

/// Test: Actions are never invoked concurrently
#[test]
fn test_actions_never_overlap() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use floodgate::core::task::ActionOutput;
    use floodgate::orchestration::FnAction;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    for i in 0..6 {
        let in_flight = Arc::clone(&in_flight);
        let max_seen = Arc::clone(&max_seen);
        let action = FnAction::new("probe", move || {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            ActionOutput::success("")
        });
        let task = if i < 3 {
            Task::ingestion(format!("raw_{}", i), false, Arc::new(action))
        } else {
            Task::transformation(format!("model_{}", i), Arc::new(action))
        };
        registry.register(task, &[]).unwrap();
    }

    let (scheduler, _sink) = scheduler_for(registry);
    let run = scheduler.run_now(TriggerKind::Manual).unwrap();

    assert_eq!(run.records.len(), 6);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}
