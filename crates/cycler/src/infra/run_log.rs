//! Run log: one JSON object per line for every milestone of a test run.
//!
//! The file is opened in append mode, so successive runs against the same path
//! build up a history of the bench.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    /// Instrument connected, profile and mode chosen
    RunStart,
    /// A charge or discharge phase terminated
    PhaseComplete,
    /// All requested phases finished
    RunEnd,
    /// The run stopped on an error or an interrupt
    RunAborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Wall-clock time, RFC 3339
    pub timestamp: String,
    /// Seconds since the run started, on the run's clock
    pub elapsed_s: f64,
    pub event_type: RunEventType,
    pub details: serde_json::Value,
}

/// Thread-safe run logger that writes to a JSONL file
pub struct RunLogger {
    writer: Mutex<BufWriter<File>>,
}

impl RunLogger {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    /// Write and flush one entry.
    pub fn log(&self, entry: &RunLogEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp: String,
        elapsed_s: f64,
        event_type: RunEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&RunLogEntry {
            timestamp,
            elapsed_s,
            event_type,
            details,
        })
    }
}
