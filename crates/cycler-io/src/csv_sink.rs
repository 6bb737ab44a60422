use chrono::{DateTime, Local};
use cycler_core::sampler::{SampleSink, TelemetryRow};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

pub const HEADER: [&str; 5] = ["Date", "Time", "delta_ms", "Voltage", "Current"];

/// `2024-03-01_1415_lab_power.csv` for a run started at 14:15.
pub fn file_name(started: DateTime<Local>) -> String {
    started.format("%Y-%m-%d_%H%M_lab_power.csv").to_string()
}

/// Appends telemetry rows to a CSV file, flushing after every row so a crash
/// loses at most the sample in flight.
pub struct CsvTelemetrySink {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl CsvTelemetrySink {
    /// Create `dir` if needed and open a fresh file named after `started`.
    pub fn create(dir: &Path, started: DateTime<Local>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name(started));
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        writer.write_record(HEADER)?;
        writer.flush()?;
        info!(target: "sampler", path = %path.display(), "telemetry file created");
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleSink for CsvTelemetrySink {
    fn append(&mut self, row: &TelemetryRow) -> io::Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()
    }
}
