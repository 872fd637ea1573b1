// src/history.rs

//! Append-only install history
//!
//! One line per install attempt, fields separated by `|`:
//!
//! ```text
//! 2024-03-09 14:05:07|armnas_0.2.1.run|success|
//! 2024-03-10 09:12:44|armnas_0.2.2.run|failure|replace_backend
//! ```
//!
//! The installer is the only writer. Readers get the most recent entries
//! first.

use crate::error::{Error, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Field separator
pub const SEPARATOR: char = '|';

/// Local time format of the date field
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default number of entries returned by [`HistoryLog::read_recent`]
pub const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Failure,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One install attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRecord {
    pub date: String,
    pub filename: String,
    pub status: UpdateStatus,
    pub error_code: Option<String>,
}

impl UpdateRecord {
    /// A record stamped with the current local time
    pub fn now(filename: &str, status: UpdateStatus, error_code: Option<&str>) -> Self {
        Self {
            date: Local::now().format(DATE_FORMAT).to_string(),
            filename: filename.to_string(),
            status,
            error_code: error_code.map(str::to_string),
        }
    }

    /// The date field as a local timestamp
    pub fn recorded_at(&self) -> Option<DateTime<Local>> {
        NaiveDateTime::parse_from_str(&self.date, DATE_FORMAT)
            .ok()?
            .and_local_timezone(Local)
            .earliest()
    }

    fn to_line(&self) -> String {
        // The separator must not leak into fields
        let clean = |s: &str| s.replace([SEPARATOR, '\n', '\r'], "_");
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            clean(&self.date),
            clean(&self.filename),
            self.status.as_str(),
            self.error_code.as_deref().map(clean).unwrap_or_default(),
            sep = SEPARATOR
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split(SEPARATOR);
        let date = fields.next()?.trim();
        let filename = fields.next()?.trim();
        let status = match fields.next()?.trim() {
            "success" => UpdateStatus::Success,
            "failure" | "failed" => UpdateStatus::Failure,
            _ => return None,
        };
        let error_code = fields
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if date.is_empty() || filename.is_empty() {
            return None;
        }

        Some(Self {
            date: date.to_string(),
            filename: filename.to_string(),
            status,
            error_code,
        })
    }
}

/// The history file
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    pub fn append(&self, record: &UpdateRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", record.to_line())?;
        Ok(())
    }

    /// The last `limit` records, most recent first
    ///
    /// A missing file is an empty history. Malformed lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<UpdateRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match UpdateRecord::parse_line(&line) {
                Some(record) => records.push(record),
                None => debug!("Skipping malformed history line: {}", line),
            }
        }

        let skip = records.len().saturating_sub(limit);
        let mut recent: Vec<_> = records.into_iter().skip(skip).collect();
        recent.reverse();
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, status: UpdateStatus, code: Option<&str>) -> UpdateRecord {
        UpdateRecord {
            date: "2024-03-09 14:05:07".to_string(),
            filename: name.to_string(),
            status,
            error_code: code.map(str::to_string),
        }
    }

    #[test]
    fn test_recorded_at() {
        let at = record("a.run", UpdateStatus::Success, None).recorded_at().unwrap();
        assert_eq!(at.format(DATE_FORMAT).to_string(), "2024-03-09 14:05:07");

        let mut bad = record("a.run", UpdateStatus::Success, None);
        bad.date = "yesterday".to_string();
        assert!(bad.recorded_at().is_none());
    }

    #[test]
    fn test_append_and_read_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("logs/history.log"));

        log.append(&record("a.run", UpdateStatus::Success, None)).unwrap();
        log.append(&record("b.run", UpdateStatus::Failure, Some("replace_backend"))).unwrap();
        log.append(&record("c.run", UpdateStatus::Success, None)).unwrap();

        let recent = log.read_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].filename, "c.run");
        assert_eq!(recent[1].filename, "b.run");
        assert_eq!(recent[1].error_code.as_deref(), Some("replace_backend"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("none.log"));
        assert!(log.read_recent(DEFAULT_LIMIT).unwrap().is_empty());
    }

    #[test]
    fn test_line_format() {
        let line = record("a.run", UpdateStatus::Failure, Some("check_privileges")).to_line();
        assert_eq!(line, "2024-03-09 14:05:07|a.run|failure|check_privileges");
        let line = record("a.run", UpdateStatus::Success, None).to_line();
        assert_eq!(line, "2024-03-09 14:05:07|a.run|success|");
    }

    #[test]
    fn test_separator_in_field_is_escaped() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("h.log"));
        log.append(&record("we|ird.run", UpdateStatus::Success, None)).unwrap();

        let recent = log.read_recent(1).unwrap();
        assert_eq!(recent[0].filename, "we_ird.run");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.log");
        fs::write(&path, "garbage\n2024-01-01 00:00:00|x.run|success|\n\n|||\n").unwrap();

        let recent = HistoryLog::new(&path).read_recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].filename, "x.run");
    }
}
