//! Append-only run log.
//!
//! Each record is serialized to one line and written with a single
//! `write_all` on an append-mode handle, so concurrent writers never split
//! or interleave a record. Recording is best-effort: on failure the record
//! is retried once at a per-user fallback location, then dropped with a
//! warning. Nothing here returns an error to the caller.

use crate::layout::StateLayout;
use crate::record::RunRecord;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes and reads the run log of one project.
#[derive(Debug, Clone)]
pub struct Recorder {
    primary: PathBuf,
    fallback: PathBuf,
}

impl Recorder {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            primary: layout.run_log_path(),
            fallback: layout.fallback_run_log_path(),
        }
    }

    /// Recorder with explicit paths.
    pub fn with_paths(primary: PathBuf, fallback: PathBuf) -> Self {
        Self { primary, fallback }
    }

    pub fn path(&self) -> &Path {
        &self.primary
    }

    /// Append a record. Failures are logged and swallowed.
    pub fn record(&self, record: &RunRecord) {
        let line = match serde_json::to_string(record) {
            Ok(mut json) => {
                json.push('\n');
                json
            }
            Err(e) => {
                warn!("Failed to serialize run record: {}", e);
                return;
            }
        };

        match append_line(&self.primary, &line) {
            Ok(()) => {
                debug!("Recorded {} outcome to {:?}", record.outcome, self.primary);
            }
            Err(primary_err) => {
                warn!(
                    "Failed to append run record to {:?}: {}; trying {:?}",
                    self.primary, primary_err, self.fallback
                );
                if let Err(fallback_err) = append_line(&self.fallback, &line) {
                    warn!(
                        outcome = %record.outcome,
                        "Dropping run record, fallback also failed: {}",
                        fallback_err
                    );
                }
            }
        }
    }

    /// Most recent `limit` records, oldest first. Malformed lines are skipped.
    pub fn read_recent(&self, limit: usize) -> io::Result<Vec<RunRecord>> {
        let file = match File::open(&self.primary) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = VecDeque::with_capacity(limit.min(1024));
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => {
                    if records.len() == limit {
                        records.pop_front();
                    }
                    if limit > 0 {
                        records.push_back(record);
                    }
                }
                Err(e) => warn!("Skipping invalid run log line: {}", e),
            }
        }
        Ok(records.into())
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
