//! Per-source log buffers for the control shell, fed from `tracing`.
//!
//! [`LogSink`] stores `(source, severity, message)` entries; [`LogSinkLayer`]
//! is a `tracing_subscriber` layer that copies every INFO-and-above event into
//! a sink, deriving the source from the event target.

mod layer;

pub use layer::{source_for_target, LogSinkLayer};

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity shown by the shell and written as the line prefix on dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogSeverity::Info => "[INFO] ",
            LogSeverity::Warning => "[WARNING] ",
            LogSeverity::Error => "[ERROR] ",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
}

/// Shared, cloneable log store keyed by source name.
#[derive(Clone, Default)]
pub struct LogSink {
    logs: Arc<RwLock<BTreeMap<String, Vec<LogEntry>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_log(&self, source: &str, message: impl Into<String>, severity: LogSeverity) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
        };
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.entry(source.to_string()).or_default().push(entry);
    }

    /// Snapshot of one source's entries (empty if the source never logged).
    pub fn get_log(&self, source: &str) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.get(source).cloned().unwrap_or_default()
    }

    pub fn get_log_names(&self) -> Vec<String> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.keys().cloned().collect()
    }

    /// Append every source to `<dir>/<source>.log`, one severity-prefixed line per entry.
    /// Returns how many files were written; a file that cannot be opened is logged and skipped.
    pub fn dump_all_to_file(&self, dir: impl AsRef<Path>) -> std::io::Result<usize> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let snapshot = {
            let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
            logs.clone()
        };

        let mut written = 0;
        for (source, entries) in snapshot {
            let path = dir.join(format!("{}.log", file_stem(&source)));
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| {
                    for entry in &entries {
                        writeln!(file, "{}{}", entry.severity.prefix(), entry.message)?;
                    }
                    file.flush()
                });
            match result {
                Ok(()) => written += 1,
                Err(e) => self.add_log(
                    "logging",
                    format!("Failed to write log file {}: {}", path.display(), e),
                    LogSeverity::Error,
                ),
            }
        }
        Ok(written)
    }
}

fn file_stem(source: &str) -> String {
    source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
