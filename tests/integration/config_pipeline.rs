//! Config-driven pipeline tests.
//!
//! These tests load a TOML config, build the scheduler from it and run
//! real subprocesses in a temporary project directory. Each task appends
//! its name to `order.log`, so invocation order is visible on disk.

#![cfg(unix)]

use std::path::Path;

use tempfile::TempDir;

use floodgate::config::Config;
use floodgate::orchestration::JsonLinesSink;
use floodgate::pipeline::{build_registry, build_scheduler};
use floodgate::{Error, RunStatus, TriggerKind};

fn write_config(dir: &Path, body: &str) -> Config {
    let header = format!(
        "project_dir = '{project}'\nprofiles_dir = '{project}'\nstorage = 'warehouse.duckdb'\n\n[sink]\npath = '{project}/materializations.jsonl'\n\n",
        project = dir.display()
    );
    let path = dir.join("floodgate.toml");
    std::fs::write(&path, format!("{}{}", header, body)).unwrap();
    Config::load_from(&path).unwrap()
}

fn order_log(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("order.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

const PIPELINE: &str = r#"
[schedule]
cron = "*/5 * * * *"

[[ingestion]]
name = "raw_readings"
command = ["sh", "-c", "echo raw_readings >> order.log"]

[[ingestion]]
name = "raw_stations"
required = false
command = ["sh", "-c", "echo raw_stations >> order.log; echo 'stations API timed out' >&2; exit 7"]

[[transformation]]
name = "staging"
command = ["sh", "-c", "echo staging >> order.log"]

[[transformation]]
name = "marts"
command = ["sh", "-c", "echo marts >> order.log; printf %s \"$FLOODGATE_STORAGE\" > storage.txt"]
depends_on = ["staging"]
"#;

/// Test: Full run from config with a tolerated ingestion failure
/// Given a config whose optional ingestion exits non-zero
/// When a manual run executes
/// Then all four commands run in order and every record reaches the sink
#[test]
fn test_config_run_tolerates_optional_failure() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), PIPELINE);

    let scheduler = build_scheduler(&config).unwrap();
    assert_eq!(scheduler.cadence().expression(), "*/5 * * * *");

    let run = scheduler.run_now(TriggerKind::Manual).unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        order_log(dir.path()),
        vec!["raw_readings", "raw_stations", "staging", "marts"]
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("storage.txt")).unwrap(),
        "warehouse.duckdb"
    );

    let tolerated = run.tolerated_failures();
    assert_eq!(tolerated.len(), 1);
    assert_eq!(tolerated[0].outcome.exit_code, 7);
    assert_eq!(tolerated[0].outcome.stderr, "stations API timed out");

    let records = JsonLinesSink::read_all(&config.sink_path().unwrap()).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.run_id == run.id));
    assert_eq!(records[1].task.as_str(), "raw_stations");
    assert!(!records[1].success);
    assert_eq!(records[1].metadata["exit_code"], 7);
}

/// Test: Required ingestion failure stops the pipeline
#[test]
fn test_config_run_aborts_on_required_failure() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        &PIPELINE.replace(
            "echo raw_readings >> order.log",
            "echo raw_readings >> order.log; exit 1",
        ),
    );

    let run = build_scheduler(&config)
        .unwrap()
        .run_now(TriggerKind::Manual)
        .unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(order_log(dir.path()), vec!["raw_readings"]);
    assert!(matches!(
        run.into_result(),
        Err(Error::RequiredTaskFailed { .. })
    ));

    let records = JsonLinesSink::read_all(&config.sink_path().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
}

/// Test: A missing program fails its task instead of the whole process
#[test]
fn test_missing_program_is_task_failure() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[ingestion]]
name = "raw_optional"
required = false
command = ["floodgate-test-no-such-binary"]

[[transformation]]
name = "build"
command = ["sh", "-c", "echo build >> order.log"]
"#,
    );

    let registry = build_registry(&config).unwrap();
    assert!(!registry.tasks()[0].action().is_available());

    let run = build_scheduler(&config)
        .unwrap()
        .run_now(TriggerKind::Manual)
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.records[0].outcome.exit_code, -1);
    assert_eq!(order_log(dir.path()), vec!["build"]);
}

/// Test: Manifest models replace the transformation list
/// Given a manifest.json generated by the prepare command
/// When the registry is built
/// Then models run upstream first, after ingestion
#[test]
fn test_manifest_prepare_and_model_order() {
    let dir = TempDir::new().unwrap();
    let manifest = r#"{"nodes": {"model.p.fct": {"resource_type": "model", "name": "fct", "depends_on": {"nodes": ["model.p.stg"]}}, "model.p.stg": {"resource_type": "model", "name": "stg", "depends_on": {"nodes": []}}}}"#;
    std::fs::write(dir.path().join("manifest.src"), manifest).unwrap();

    let config = write_config(
        dir.path(),
        r#"
[[ingestion]]
name = "raw_readings"
command = ["sh", "-c", "echo raw_readings >> order.log"]

[manifest]
path = "target/manifest.json"
prepare = ["sh", "-c", "mkdir -p target && cp manifest.src target/manifest.json"]
command = ["sh", "-c", "echo \"$0\" >> order.log"]
"#,
    );

    let scheduler = build_scheduler(&config).unwrap();
    assert!(dir.path().join("target/manifest.json").exists());

    let run = scheduler.run_now(TriggerKind::Manual).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(order_log(dir.path()), vec!["raw_readings", "stg", "fct"]);
}
