//! # JSON Lines writer and reader
//!
//! Files are opened in append mode and each entry is written with a single
//! `write` of one complete line, so concurrent appenders never interleave
//! partial lines. Readers skip lines that fail to parse.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::entry::ExecutionLogEntry;
use crate::errors::{AuditError, Result};

/// How entries are spread over files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Partition {
    /// `<dir>/<subject>.jsonl`
    #[default]
    PerSubject,
    /// `<dir>/<YYYY-MM-DD>.jsonl`, all subjects mixed; for high-volume logs.
    Daily,
}

/// Appends and reads [`ExecutionLogEntry`] lines under one directory.
#[derive(Clone, Debug)]
pub struct AuditLogWriter {
    dir: PathBuf,
    partition: Partition,
}

impl AuditLogWriter {
    /// One file per subject under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            partition: Partition::PerSubject,
        }
    }

    /// One file per UTC day under `dir`.
    pub fn daily(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            partition: Partition::Daily,
        }
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Partitioning scheme.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Append one entry to the file for `entry.subject_id`.
    pub fn append(&self, entry: &ExecutionLogEntry) -> Result<()> {
        validate_subject(&entry.subject_id)?;
        fs::create_dir_all(&self.dir)?;

        let path = match self.partition {
            Partition::PerSubject => self.subject_path(&entry.subject_id),
            Partition::Daily => self
                .dir
                .join(format!("{}.jsonl", entry.timestamp.format("%Y-%m-%d"))),
        };

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        debug!(subject = %entry.subject_id, path = %path.display(), "audit entry appended");
        Ok(())
    }

    /// Up to `limit` entries for one subject, newest first.
    pub fn read_recent(&self, subject_id: &str, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        validate_subject(subject_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        match self.partition {
            Partition::PerSubject => {
                let mut entries = read_file(&self.subject_path(subject_id))?;
                entries.reverse();
                entries.truncate(limit);
                Ok(entries)
            }
            Partition::Daily => {
                let mut out = Vec::new();
                // newest day first
                for path in self.log_files()?.into_iter().rev() {
                    let mut day: Vec<_> = read_file(&path)?
                        .into_iter()
                        .filter(|e| e.subject_id == subject_id)
                        .collect();
                    day.reverse();
                    out.extend(day);
                    if out.len() >= limit {
                        break;
                    }
                }
                out.truncate(limit);
                Ok(out)
            }
        }
    }

    /// Up to `limit` entries across every subject, newest first.
    pub fn read_all(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        let mut all = Vec::new();
        for path in self.log_files()? {
            all.extend(read_file(&path)?);
        }
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }

    fn subject_path(&self, subject_id: &str) -> PathBuf {
        self.dir.join(format!("{subject_id}.jsonl"))
    }

    /// Every `*.jsonl` file in the directory, sorted by name.
    fn log_files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<PathBuf> = read_dir
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Subject ids become file names, so anything that could leave the
/// directory is refused.
fn validate_subject(subject_id: &str) -> Result<()> {
    let bad = subject_id.is_empty()
        || subject_id == "."
        || subject_id.contains("..")
        || subject_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(AuditError::InvalidSubject(subject_id.to_owned()));
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<ExecutionLogEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExecutionLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed audit line");
            }
        }
    }
    Ok(entries)
}
