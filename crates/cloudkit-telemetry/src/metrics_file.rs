//! Hourly rotating metric files.
//!
//! Lines are appended to `<dir>/<YYYY-MM-DD-HH>.metrics`, one file per UTC
//! hour. When the hour changes, files older than the retention window are
//! deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeDelta, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Extension of every metric file.
pub const METRICS_FILE_EXTENSION: &str = "metrics";

/// Default retention: three days of hourly files.
pub const DEFAULT_RETENTION_HOURS: u64 = 72;

struct OpenFile {
    hour: DateTime<Utc>,
    file: File,
}

/// Append-only metric file that rotates every UTC hour.
pub struct RotatingMetricsFile {
    dir: PathBuf,
    retention: TimeDelta,
    current: Mutex<Option<OpenFile>>,
}

impl RotatingMetricsFile {
    /// Create the directory if needed. Nothing is opened until the first line.
    pub fn new(dir: impl Into<PathBuf>, retention_hours: u64) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let hours = i64::try_from(retention_hours).unwrap_or(i64::MAX);
        Ok(Self {
            dir,
            retention: TimeDelta::try_hours(hours).unwrap_or(TimeDelta::MAX),
            current: Mutex::new(None),
        })
    }

    /// Directory holding the metric files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `line` to the file for the current hour.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        self.write_line_at(Utc::now(), line)
    }

    /// Append `line` to the file for the hour containing `now`.
    pub fn write_line_at(&self, now: DateTime<Utc>, line: &str) -> io::Result<()> {
        let hour = hour_start(now);
        let mut current = self.current.lock();
        if current.as_ref().is_none_or(|open| open.hour != hour) {
            let path = self.dir.join(file_name(hour));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(path = %path.display(), "opened metrics file");
            *current = Some(OpenFile { hour, file });
            if let Err(error) = self.prune(hour) {
                warn!(%error, dir = %self.dir.display(), "failed to prune metrics files");
            }
        }
        match current.as_mut() {
            Some(open) => writeln!(open.file, "{line}"),
            None => Ok(()),
        }
    }

    /// Metric files in the directory, oldest first.
    pub fn files(&self) -> io::Result<Vec<(DateTime<Utc>, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(hour) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_file_name)
            {
                files.push((hour, path));
            }
        }
        files.sort_by_key(|(hour, _)| *hour);
        Ok(files)
    }

    fn prune(&self, current: DateTime<Utc>) -> io::Result<usize> {
        let cutoff = current.checked_sub_signed(self.retention);
        let mut removed = 0;
        for (hour, path) in self.files()? {
            if cutoff.is_none_or(|cutoff| hour > cutoff) {
                continue;
            }
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed expired metrics file");
            removed += 1;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for RotatingMetricsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingMetricsFile")
            .field("dir", &self.dir)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(at.hour(), 0, 0)
        .map_or(at, |naive| naive.and_utc())
}

fn file_name(hour: DateTime<Utc>) -> String {
    format!("{}.{METRICS_FILE_EXTENSION}", hour.format("%Y-%m-%d-%H"))
}

/// Parse `YYYY-MM-DD-HH.metrics` into the start of that hour.
fn parse_file_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(METRICS_FILE_EXTENSION)?.strip_suffix('.')?;
    let (date, hour) = stem.rsplit_once('-')?;
    if hour.len() != 2 {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(hour.parse().ok()?, 0, 0)?.and_utc())
}
