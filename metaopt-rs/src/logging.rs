//! Append-only run log and wall-clock timer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::MetaOptConfig;
use crate::error::Result;

/// Append-only text log in the output directory.
///
/// Every line is mirrored to `tracing` at info level.
pub struct TrainLog {
    path: PathBuf,
    file: File,
}

impl TrainLog {
    /// File name inside the output directory.
    pub const FILE_NAME: &'static str = "train_log.txt";

    /// Open (or create) `dir/train_log.txt` for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn log(&mut self, message: &str) -> Result<()> {
        tracing::info!("{message}");
        writeln!(self.file, "{message}")?;
        self.file.flush()?;
        Ok(())
    }

    /// Append the run header: start time and the full configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn log_header(&mut self, config: &MetaOptConfig) -> Result<()> {
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.log(&format!("Run started {started}"))?;
        self.log(&serde_json::to_string(config)?)
    }
}

/// Measures elapsed wall time and extrapolates the total.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Start timing now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time formatted as hours, minutes or seconds.
    #[must_use]
    pub fn measure(&self) -> String {
        format_duration(self.elapsed().as_secs_f64())
    }

    /// Projected total time given the completed `fraction` of the run.
    #[must_use]
    pub fn estimate(&self, fraction: f64) -> String {
        if fraction <= 0.0 {
            return format_duration(0.0);
        }
        format_duration(self.elapsed().as_secs_f64() / fraction)
    }
}

/// `1.5h`, `12m` or `42s`.
#[must_use]
pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0).floor();
    if secs >= 3600.0 {
        format!("{:.1}h", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{}m", (secs / 60.0).round() as u64)
    } else {
        format!("{}s", secs as u64)
    }
}
