use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use floodgate::config::Config;
use floodgate::orchestration::{Cadence, JsonLinesSink, SchedulerEvent};
use floodgate::pipeline::{build_registry, build_scheduler};
use floodgate::{flog, flog_debug, Error, Result, Run, RunStatus, TriggerKind};

/// Floodgate - scheduled ingest-then-transform refresh runner
#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FLOODGATE_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.floodgate/floodgate.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log per-tick cron decisions (implies --debug)
    #[arg(long)]
    pub trace: bool,

    /// Mirror log lines to stderr
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Config file (default: ~/.floodgate/floodgate.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Fire runs on the configured cron cadence until interrupted
    Serve,

    /// Execute one run now, in the foreground
    Run,

    /// Print the task order a run would follow
    Plan,

    /// Show whether the schedule is enabled and when it fires next
    Status,

    /// Show recent materialization records
    History {
        /// Number of records to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Check that every task's program is installed
    Check,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    floodgate::log::init_with_debug(cli.debug || cli.trace);
    if cli.trace {
        floodgate::log::set_level(floodgate::log::LogLevel::Trace);
    }
    floodgate::log::set_echo(cli.verbose);
    if floodgate::log::is_debug() {
        flog_debug!("floodgate starting (debug mode enabled)");
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    if let Command::Init { force } = cli.command {
        return run_init(&config_path, force);
    }

    let config = Config::load_from(&config_path)?;

    match cli.command {
        Command::Serve => run_serve(&config),
        Command::Run => run_once(&config),
        Command::Plan => run_plan(&config),
        Command::Status => run_status(&config),
        Command::History { limit } => run_history(&config, limit),
        Command::Check => run_check(&config),
        Command::Init { .. } => unreachable!("handled above"),
    }
}

fn run_init(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Config::default().save_to(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run_serve(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = Arc::new(build_scheduler(config)?.with_events(event_tx));

        let status = scheduler.schedule_status();
        println!(
            "Serving {} tasks on '{}' (enabled: {}, next: {})",
            scheduler.registry().len(),
            status.cron,
            status.enabled,
            status
                .next_fire_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );

        let handle = scheduler.spawn();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted; waiting for the active run to finish");
                    break;
                }
                Some(event) = event_rx.recv() => print_event(&event),
            }
        }

        handle.stop().await;
        while let Ok(event) = event_rx.try_recv() {
            print_event(&event);
        }
        flog!("floodgate serve stopped");
        Ok(())
    })
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::RunStarted { run_id, trigger } => {
            println!("run {} started ({})", run_id.short(), trigger)
        }
        SchedulerEvent::TaskFinished {
            run_id,
            task,
            success,
        } => println!(
            "run {} {:<24} {}",
            run_id.short(),
            task,
            if *success { "ok" } else { "FAILED" }
        ),
        SchedulerEvent::RunFinished { run_id, status } => {
            println!("run {} {}", run_id.short(), status)
        }
        SchedulerEvent::TriggerDropped { trigger, active } => println!(
            "{} trigger dropped: run {} still active",
            trigger,
            active.short()
        ),
    }
}

fn run_once(config: &Config) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let run = scheduler.run_now(TriggerKind::Manual)?;
    print_run(&run);
    run.into_result().map(|_| ())
}

fn print_run(run: &Run) {
    for record in &run.records {
        let state = match (record.outcome.success, record.required) {
            (true, _) => "ok",
            (false, true) => "FAILED",
            (false, false) => "failed (tolerated)",
        };
        println!(
            "{:<24} {:>8.2}s  {}",
            record.task,
            record.outcome.duration.as_secs_f64(),
            state
        );
    }
    println!("run {} {}", run.id.short(), run.status);
    if run.status == RunStatus::Succeeded && !run.tolerated_failures().is_empty() {
        println!(
            "{} optional task(s) failed; downstream used existing data",
            run.tolerated_failures().len()
        );
    }
}

fn run_plan(config: &Config) -> Result<()> {
    let registry = build_registry(config)?;
    for (i, task) in registry.topological_order().iter().enumerate() {
        println!(
            "{:>3}. {:<24} {:<15} {:<9} {}",
            i + 1,
            task.name,
            task.kind,
            if task.required { "required" } else { "optional" },
            task.action().describe()
        );
    }
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let cadence = Cadence::parse(&config.schedule.cron)?;
    println!("cron:      {}", cadence.expression());
    println!("enabled:   {}", config.schedule.enabled);
    let next = if config.schedule.enabled {
        cadence
            .next_after(chrono::Utc::now())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    } else {
        "-".to_string()
    };
    println!("next fire: {}", next);

    let records = JsonLinesSink::read_tail(&config.sink_path()?, 1)?;
    if let Some(last) = records.last() {
        println!(
            "last task: {} ({}) at {}",
            last.task,
            if last.success { "ok" } else { "failed" },
            last.recorded_at.to_rfc3339()
        );
    }
    Ok(())
}

fn run_history(config: &Config, limit: usize) -> Result<()> {
    let records = JsonLinesSink::read_tail(&config.sink_path()?, limit)?;
    for record in &records {
        println!(
            "{} {} {:<24} {:>8.2}s  {}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            record.run_id.short(),
            record.task,
            record.duration_secs,
            if record.success { "ok" } else { "failed" }
        );
    }
    Ok(())
}

fn run_check(config: &Config) -> Result<()> {
    let registry = build_registry(config)?;
    let mut missing = 0;
    for task in registry.tasks() {
        let action = task.action();
        let available = action.is_available();
        if !available {
            missing += 1;
        }
        println!(
            "{:<24} {:<12} {}",
            task.name,
            action.program().unwrap_or("-"),
            if available { "ok" } else { "NOT FOUND" }
        );
    }
    if missing > 0 {
        return Err(Error::Validation(format!(
            "{} task program(s) not found on PATH",
            missing
        )));
    }
    Ok(())
}
