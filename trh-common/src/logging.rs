//! Diagnostic logging setup.
//!
//! The hook and the detached runner must never write to the agent's
//! terminal, so they log JSON lines to the project's `test-runner.log`.
//! Interactive subcommands log to stderr instead. Setup failures are
//! reported and otherwise ignored.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Where diagnostics go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Append JSON lines to this file.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub target: LogTarget,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            target: LogTarget::Stderr,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = LogTarget::File(path.into());
        self
    }

    /// `RUST_LOG` wins when set; otherwise our crates log at `level`.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| {
                EnvFilter::try_new(format!(
                    "trh={level},trh_common={level}",
                    level = self.level
                ))
            })
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps buffered log output flowing until dropped.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Returns an error only if the log file cannot be opened; a subscriber that
/// is already installed is left in place.
pub fn init_logging(config: &LogConfig) -> io::Result<LoggingGuard> {
    match &config.target {
        LogTarget::Stderr => {
            let _ = tracing_subscriber::registry()
                .with(config.filter())
                .with(fmt::layer().with_writer(io::stderr).with_target(false))
                .try_init();
            Ok(LoggingGuard::default())
        }
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, worker) = tracing_appender::non_blocking(file);
            let _ = tracing_subscriber::registry()
                .with(config.filter())
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(false)
                        .with_ansi(false),
                )
                .try_init();
            Ok(LoggingGuard {
                _worker: Some(worker),
            })
        }
    }
}
