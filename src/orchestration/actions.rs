//! Task actions: subprocess commands and in-process closures.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::task::{ActionOutput, TaskAction};
use crate::{flog_debug, Error, Result};

/// Runs an external program and reports its exit code and captured output.
///
/// A program that cannot be spawned is reported as exit code -1 with the
/// spawn error as stderr, so it goes through the same failure policy as a
/// program that ran and failed.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandAction {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Build from an argv list such as `["dbt", "build"]`.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Validation("command must not be empty".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl TaskAction for CommandAction {
    fn invoke(&self) -> ActionOutput {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        flog_debug!("CommandAction::invoke argv={:?} cwd={:?}", self.argv(), self.cwd);

        match cmd.output() {
            Ok(output) => ActionOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            },
            Err(e) => ActionOutput::failure(-1, format!("failed to spawn {}: {}", self.program, e)),
        }
    }

    fn program(&self) -> Option<&str> {
        Some(&self.program)
    }

    /// The program resolves on `PATH` (or is a valid path).
    fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn describe(&self) -> String {
        self.argv().join(" ")
    }
}

/// Wraps a closure as a task action.
pub struct FnAction<F> {
    label: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn() -> ActionOutput + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

impl<F> TaskAction for FnAction<F>
where
    F: Fn() -> ActionOutput + Send + Sync,
{
    fn invoke(&self) -> ActionOutput {
        (self.f)()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
