use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::expand_tilde;
use crate::{flog_debug, Error, Result};

pub const DEFAULT_CRON: &str = "*/15 * * * *";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Derive transformation tasks from a dbt `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Relative paths resolve against `project_dir`.
    pub path: String,
    /// Run when the manifest file is missing.
    pub prepare: Option<Vec<String>>,
    /// Model name is appended as the last argument.
    #[serde(default = "default_model_command")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub path: Option<String>,
    /// Rotate the records file once it reaches this size.
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub project_dir: Option<String>,
    pub profiles_dir: Option<String>,
    pub storage: Option<String>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_ingestion")]
    pub ingestion: Vec<IngestionConfig>,
    #[serde(default = "default_transformation")]
    pub transformation: Vec<TransformationConfig>,
    pub manifest: Option<ManifestConfig>,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: None,
            profiles_dir: None,
            storage: None,
            schedule: ScheduleConfig::default(),
            ingestion: default_ingestion(),
            transformation: default_transformation(),
            manifest: None,
            sink: SinkConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cron() -> String {
    DEFAULT_CRON.to_string()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_model_command() -> Vec<String> {
    argv(&["dbt", "build", "--select"])
}

fn default_ingestion() -> Vec<IngestionConfig> {
    vec![IngestionConfig {
        name: "load_raw_data".to_string(),
        required: true,
        command: argv(&["dbt", "run-operation", "load_raw_data"]),
    }]
}

fn default_transformation() -> Vec<TransformationConfig> {
    vec![TransformationConfig {
        name: "build".to_string(),
        command: argv(&["dbt", "build"]),
        depends_on: Vec::new(),
    }]
}

impl Config {
    pub fn floodgate_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".floodgate"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::floodgate_dir()?.join("floodgate.toml"))
    }

    /// Working directory for task commands; the current directory if unset.
    pub fn project_dir(&self) -> PathBuf {
        match &self.project_dir {
            Some(dir) => expand_tilde(dir),
            None => PathBuf::from("."),
        }
    }

    pub fn profiles_dir(&self) -> Result<PathBuf> {
        match &self.profiles_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".dbt")),
        }
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage.as_deref().map(expand_tilde)
    }

    pub fn sink_path(&self) -> Result<PathBuf> {
        match &self.sink.path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::floodgate_dir()?.join("materializations.jsonl")),
        }
    }

    /// Manifest location, resolved against `project_dir` when relative.
    pub fn manifest_path(&self) -> Option<PathBuf> {
        let manifest = self.manifest.as_ref()?;
        let path = expand_tilde(&manifest.path);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(self.project_dir().join(path))
        }
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        flog_debug!(
            "Config loaded: cron={}, enabled={}, ingestion={}, transformation={}, manifest={}",
            config.schedule.cron,
            config.schedule.enabled,
            config.ingestion.len(),
            config.transformation.len(),
            config.manifest.is_some()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                flog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
