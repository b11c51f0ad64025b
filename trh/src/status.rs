//! `trh status` and `trh history`: read-only views of a project's hook state.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use trh_common::config::{self, Configuration, Resolution, Resolved};
use trh_common::{
    DebounceGate, LockState, Recorder, RunLock, RunRecord, StateLayout, VERSION,
};

/// Snapshot printed by `trh status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub project_dir: PathBuf,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Configuration>,
    pub warnings: Vec<String>,
    pub lock: LockReport,
    pub last_trigger: Option<DateTime<Utc>>,
    pub last_run: Option<RunRecord>,
    pub run_log: PathBuf,
}

/// Lock state as seen by `trh status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockReport {
    Absent,
    Held {
        holder_pid: u32,
        acquired_at: DateTime<Utc>,
        live: bool,
    },
    Corrupt,
    Unreadable {
        error: String,
    },
}

impl StatusReport {
    pub fn collect(project_dir: &Path, resolved: Resolved) -> Self {
        let layout = StateLayout::new(project_dir);

        let (enabled, disabled_reason, config) = match resolved.resolution {
            Resolution::Enabled(config) => (true, None, Some(config)),
            Resolution::Disabled(reason) => (false, Some(reason.to_string()), None),
        };

        let lock = match RunLock::new(&layout).inspect() {
            Ok(LockState::Absent) => LockReport::Absent,
            Ok(LockState::Held(record)) => LockReport::Held {
                live: record.is_live(),
                holder_pid: record.holder_pid,
                acquired_at: record.acquired_at,
            },
            Ok(LockState::Corrupt(_)) => LockReport::Corrupt,
            Err(e) => LockReport::Unreadable {
                error: e.to_string(),
            },
        };

        let recorder = Recorder::new(&layout);
        let last_run = recorder
            .read_recent(1)
            .ok()
            .and_then(|mut records| records.pop());

        Self {
            version: VERSION,
            project_dir: layout.project_dir().to_path_buf(),
            enabled,
            disabled_reason,
            config,
            warnings: resolved.warnings.iter().map(|w| w.to_string()).collect(),
            lock,
            last_trigger: DebounceGate::new(&layout).last_trigger(),
            last_run,
            run_log: recorder.path().to_path_buf(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("trh {}\n", self.version));
        out.push_str(&format!("Project:   {}\n", self.project_dir.display()));

        match (&self.config, &self.disabled_reason) {
            (Some(config), _) => {
                out.push_str("Enabled:   yes\n");
                out.push_str(&format!(
                    "Command:   {} ({})\n",
                    config.command.value,
                    config.command.origin()
                ));
                out.push_str(&format!(
                    "Timeout:   {}s ({})\n",
                    config.timeout_seconds.value,
                    config.timeout_seconds.origin()
                ));
                out.push_str(&format!(
                    "Debounce:  {}s ({})\n",
                    config.debounce_seconds.value,
                    config.debounce_seconds.origin()
                ));
                out.push_str(&format!(
                    "Output:    {} bytes max ({})\n",
                    config.max_output_bytes.value,
                    config.max_output_bytes.origin()
                ));
            }
            (None, reason) => {
                out.push_str(&format!(
                    "Enabled:   no ({})\n",
                    reason.as_deref().unwrap_or("disabled")
                ));
            }
        }
        for warning in &self.warnings {
            out.push_str(&format!("Warning:   {}\n", warning));
        }

        let lock = match &self.lock {
            LockReport::Absent => "free".to_string(),
            LockReport::Held {
                holder_pid,
                acquired_at,
                live: true,
            } => format!("held by pid {} since {}", holder_pid, timestamp(acquired_at)),
            LockReport::Held {
                holder_pid,
                live: false,
                ..
            } => format!("stale (pid {} is gone)", holder_pid),
            LockReport::Corrupt => "corrupt record".to_string(),
            LockReport::Unreadable { error } => format!("unreadable ({})", error),
        };
        out.push_str(&format!("Lock:      {}\n", lock));

        out.push_str(&format!(
            "Triggered: {}\n",
            self.last_trigger
                .as_ref()
                .map(timestamp)
                .unwrap_or_else(|| "never".to_string())
        ));
        out.push_str(&format!(
            "Last run:  {}\n",
            self.last_run
                .as_ref()
                .map(summarize)
                .unwrap_or_else(|| "none".to_string())
        ));
        out.push_str(&format!("Run log:   {}\n", self.run_log.display()));
        out
    }
}

/// Handle `trh status`.
pub fn status(project_dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let project_dir = project_dir_or_cwd(project_dir)?;
    let report = StatusReport::collect(&project_dir, config::resolve());
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

/// Handle `trh history`.
pub fn history(project_dir: Option<PathBuf>, limit: usize, json: bool) -> anyhow::Result<()> {
    let project_dir = project_dir_or_cwd(project_dir)?;
    let recorder = Recorder::new(&StateLayout::new(&project_dir));
    let records = recorder
        .read_recent(limit)
        .with_context(|| format!("Failed to read {:?}", recorder.path()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No test runs recorded in {}", recorder.path().display());
    } else {
        for record in &records {
            println!("{}", summarize(record));
        }
    }
    Ok(())
}

fn project_dir_or_cwd(project_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match project_dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

/// One-line description of a record.
pub fn summarize(record: &RunRecord) -> String {
    let mut line = format!("{}  {:<13}", timestamp(&record.started_at), record.outcome);
    if let Some(code) = record.exit_code {
        line.push_str(&format!("  exit={}", code));
    }
    if record.outcome.ran() {
        line.push_str(&format!("  {}ms", record.duration_ms));
    }
    if let Some(file) = &record.file_path {
        line.push_str(&format!("  {}", file));
    }
    if record.truncated {
        line.push_str("  [truncated]");
    }
    line
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
