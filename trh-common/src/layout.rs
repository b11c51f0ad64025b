//! On-disk layout of the per-project hook state.
//!
//! Everything lives under `<project>/.claude/logs/` so that separate
//! projects never share a debounce marker, lock, or run log.

use std::io;
use std::path::{Path, PathBuf};

const STATE_DIR: &str = ".claude/logs";
const DEBOUNCE_FILE: &str = ".last_run";
const DEBOUNCE_GUARD_FILE: &str = ".last_run.guard";
const LOCK_FILE: &str = ".lock";
const LOCK_GUARD_FILE: &str = ".lock.guard";
const RUN_LOG_FILE: &str = "test-runs.jsonl";
const DIAGNOSTIC_LOG_FILE: &str = "test-runner.log";

/// Paths of every persisted object for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    project_dir: PathBuf,
    state_dir: PathBuf,
}

impl StateLayout {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let state_dir = project_dir.join(STATE_DIR);
        Self {
            project_dir,
            state_dir,
        }
    }

    /// Create the state directory if needed.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn debounce_path(&self) -> PathBuf {
        self.state_dir.join(DEBOUNCE_FILE)
    }

    pub fn debounce_guard_path(&self) -> PathBuf {
        self.state_dir.join(DEBOUNCE_GUARD_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn lock_guard_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_GUARD_FILE)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.state_dir.join(RUN_LOG_FILE)
    }

    pub fn diagnostic_log_path(&self) -> PathBuf {
        self.state_dir.join(DIAGNOSTIC_LOG_FILE)
    }

    /// Stable short identifier for the project, derived from its path.
    pub fn project_id(&self) -> String {
        let canonical = self
            .project_dir
            .canonicalize()
            .unwrap_or_else(|_| self.project_dir.clone());
        let hash = blake3::hash(canonical.to_string_lossy().as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// Run log used when the project's own log cannot be written.
    pub fn fallback_run_log_path(&self) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("trh")
            .join(format!("{}.jsonl", self.project_id()))
    }
}
