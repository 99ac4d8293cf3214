//! Wiring configuration into a registry, an executor and a scheduler.
//!
//! Ingestion tasks are registered first, in config order. Transformation
//! tasks come from the manifest when one is configured (replacing the
//! `[[transformation]]` list), otherwise from the config in declaration
//! order; a `depends_on` entry must name a task declared earlier.

pub mod manifest;

use std::sync::Arc;

use crate::config::Config;
use crate::core::registry::TaskRegistry;
use crate::core::task::{Task, TaskName};
use crate::orchestration::actions::CommandAction;
use crate::orchestration::executor::RunExecutor;
use crate::orchestration::materialization::{
    FanoutSink, JsonLinesSink, LogSink, DEFAULT_MAX_BYTES,
};
use crate::orchestration::scheduler::{Cadence, Scheduler};
use crate::{flog_debug, Result};

pub use manifest::ModelNode;

/// A command that runs in the project directory with the storage and
/// profile locations exported.
fn command(config: &Config, argv: &[String]) -> Result<CommandAction> {
    let mut action = CommandAction::from_argv(argv)?.current_dir(config.project_dir());
    action = action.env(
        "DBT_PROFILES_DIR",
        config.profiles_dir()?.to_string_lossy().into_owned(),
    );
    if let Some(storage) = config.storage_path() {
        action = action.env("FLOODGATE_STORAGE", storage.to_string_lossy().into_owned());
    }
    Ok(action)
}

/// Build the task registry described by `config`.
pub fn build_registry(config: &Config) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();

    for ingestion in &config.ingestion {
        let action = command(config, &ingestion.command)?;
        flog_debug!(
            "Registering ingestion {} required={} ({})",
            ingestion.name,
            ingestion.required,
            ingestion.command.join(" ")
        );
        registry.register(
            Task::ingestion(ingestion.name.as_str(), ingestion.required, Arc::new(action)),
            &[],
        )?;
    }

    match (&config.manifest, config.manifest_path()) {
        (Some(manifest), Some(path)) => {
            let prepare = manifest
                .prepare
                .as_ref()
                .map(|argv| command(config, argv))
                .transpose()?;
            manifest::ensure_manifest(&path, prepare.as_ref())?;

            for model in manifest::load_models(&path)? {
                let mut argv = manifest.command.clone();
                argv.push(model.name.clone());
                let action = command(config, &argv)?;
                let deps: Vec<TaskName> =
                    model.depends_on.iter().map(|d| TaskName::from(d.as_str())).collect();
                flog_debug!("Registering model {} after {:?}", model.name, model.depends_on);
                registry.register(
                    Task::transformation(model.name.as_str(), Arc::new(action)),
                    &deps,
                )?;
            }
        }
        _ => {
            for transformation in &config.transformation {
                let action = command(config, &transformation.command)?;
                let deps: Vec<TaskName> = transformation
                    .depends_on
                    .iter()
                    .map(|d| TaskName::from(d.as_str()))
                    .collect();
                flog_debug!(
                    "Registering transformation {} after {:?}",
                    transformation.name,
                    transformation.depends_on
                );
                registry.register(
                    Task::transformation(transformation.name.as_str(), Arc::new(action)),
                    &deps,
                )?;
            }
        }
    }

    Ok(registry)
}

/// Executor that logs every record and appends it to the configured file.
pub fn build_executor(config: &Config) -> Result<RunExecutor> {
    let sink = FanoutSink::new()
        .with(Arc::new(LogSink))
        .with(Arc::new(
            JsonLinesSink::new(config.sink_path()?)
                .with_max_bytes(config.sink.max_bytes.unwrap_or(DEFAULT_MAX_BYTES)),
        ));
    Ok(RunExecutor::new(Arc::new(sink)))
}

/// Scheduler over the registry, executor and cadence in `config`.
pub fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let cadence = Cadence::parse(&config.schedule.cron)?;
    let registry = build_registry(config)?;
    let executor = build_executor(config)?;
    Ok(Scheduler::new(registry, executor, cadence).with_enabled(config.schedule.enabled))
}
