//! Materialization records: per-task telemetry emitted after each invocation.
//!
//! Sinks are append-only and never influence control flow. A sink that
//! fails to persist a record logs the problem and carries on.

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::run::{RunId, TaskRecord};
use crate::core::task::TaskName;
use crate::{flog, flog_error, flog_warn, Result};

/// Captured output is truncated to this many bytes in metadata.
const MAX_CAPTURED_BYTES: usize = 4096;

/// Telemetry for one task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationRecord {
    pub run_id: RunId,
    pub task: TaskName,
    pub required: bool,
    pub success: bool,
    pub duration_secs: f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl MaterializationRecord {
    pub fn from_task_record(run_id: RunId, record: &TaskRecord) -> Self {
        let outcome = &record.outcome;
        let mut metadata = BTreeMap::new();
        metadata.insert("exit_code".to_string(), Value::from(outcome.exit_code));
        if !outcome.stdout.is_empty() {
            metadata.insert(
                "stdout".to_string(),
                Value::from(truncate(&outcome.stdout, MAX_CAPTURED_BYTES)),
            );
        }
        if !outcome.stderr.is_empty() {
            metadata.insert(
                "stderr".to_string(),
                Value::from(truncate(&outcome.stderr, MAX_CAPTURED_BYTES)),
            );
        }

        Self {
            run_id,
            task: record.task.clone(),
            required: record.required,
            success: outcome.success,
            duration_secs: outcome.duration.as_secs_f64(),
            recorded_at: outcome.finished_at,
            metadata,
        }
    }
}

/// Keep the tail of `s`, which is where tools put the interesting part.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

/// Destination for materialization records.
pub trait MaterializationSink: Send + Sync {
    fn record(&self, record: &MaterializationRecord);
}

/// Writes one log line per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MaterializationSink for LogSink {
    fn record(&self, record: &MaterializationRecord) {
        if record.success {
            flog!(
                "materialized run={} task={} duration={:.3}s",
                record.run_id.short(),
                record.task,
                record.duration_secs
            );
        } else {
            flog_warn!(
                "materialization failed run={} task={} required={} duration={:.3}s",
                record.run_id.short(),
                record.task,
                record.required,
                record.duration_secs
            );
        }
    }
}

/// Default size at which the records file is rotated.
pub const DEFAULT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Appends records as JSON lines to a file.
///
/// When the file reaches `max_bytes` it is renamed to `<path>.1`
/// (replacing any older rotation) and a fresh file is started.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
    max_bytes: u64,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous file goes on rotation.
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    fn append(&self, record: &MaterializationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;

        let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if len > 0 && len >= self.max_bytes {
            flog!(
                "Rotating {} ({} bytes) to {}",
                self.path.display(),
                len,
                self.rotated_path().display()
            );
            std::fs::rename(&self.path, self.rotated_path())?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if ends_mid_line(&mut file)? {
            // A previous writer died partway through a line.
            writeln!(file)?;
        }
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read every record in the file; a missing file reads as empty.
    ///
    /// Lines that do not parse are skipped with a warning.
    pub fn read_all(path: &Path) -> Result<Vec<MaterializationRecord>> {
        let mut records = Vec::new();
        Self::scan(path, |record| records.push(record))?;
        Ok(records)
    }

    /// The last `limit` records in the file, oldest first.
    pub fn read_tail(path: &Path, limit: usize) -> Result<Vec<MaterializationRecord>> {
        let mut tail = VecDeque::with_capacity(limit);
        Self::scan(path, |record| {
            if limit == 0 {
                return;
            }
            if tail.len() == limit {
                tail.pop_front();
            }
            tail.push_back(record);
        })?;
        Ok(tail.into_iter().collect())
    }

    fn scan<F>(path: &Path, mut each: F) -> Result<()>
    where
        F: FnMut(MaterializationRecord),
    {
        if !path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => each(record),
                Err(e) => flog_warn!(
                    "Skipping unreadable record at {}:{}: {}",
                    path.display(),
                    n + 1,
                    e
                ),
            }
        }
        Ok(())
    }
}

/// True when the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut std::fs::File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl MaterializationSink for JsonLinesSink {
    fn record(&self, record: &MaterializationRecord) {
        if let Err(e) = self.append(record) {
            flog_error!(
                "JsonLinesSink: failed to append to {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Keeps records in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MaterializationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MaterializationRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl MaterializationSink for MemorySink {
    fn record(&self, record: &MaterializationRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Forwards each record to every inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MaterializationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MaterializationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MaterializationSink for FanoutSink {
    fn record(&self, record: &MaterializationRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}
