use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use trh_common::{Outcome, Recorder, RunRecord, StateLayout};

/// Every variable the hook reads, so the developer's own settings never leak in.
const CONFIG_VARS: &[&str] = &[
    "COMMAND",
    "TIMEOUT",
    "DEBOUNCE",
    "ENABLED",
    "MAX_OUTPUT",
    "KILL_GRACE_MS",
    "LOG_LEVEL",
];

/// A throwaway project directory driven through the real `trh` binary.
pub struct HookProject {
    pub dir: TempDir,
    env: Vec<(String, String)>,
}

/// One finished hook invocation.
pub struct HookRun {
    pub output: Output,
    pub elapsed: Duration,
}

impl HookProject {
    pub fn new(command: &str) -> Self {
        crate::test_log!("FIXTURE: Creating hook project for command {:?}", command);

        let dir = TempDir::new().expect("Failed to create temp dir");
        Self {
            dir,
            env: vec![("CLAUDE_TEST_COMMAND".to_string(), command.to_string())],
        }
    }

    /// Set `CLAUDE_TEST_<name>` for every invocation.
    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.push((format!("CLAUDE_TEST_{}", name), value.to_string()));
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.path())
    }

    pub fn edit_payload(&self, file: &str) -> String {
        json!({
            "session_id": "test-session",
            "hook_event_name": "PostToolUse",
            "tool_name": "Edit",
            "tool_input": { "file_path": file, "old_string": "a", "new_string": "b" },
            "cwd": self.path(),
        })
        .to_string()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_trh"));
        cmd.current_dir(self.path()).env_remove("RUST_LOG");
        for var in CONFIG_VARS {
            cmd.env_remove(format!("CLAUDE_TEST_{}", var));
        }
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        cmd
    }

    /// Invoke the hook with `payload` on stdin and wait for it to exit.
    pub fn trigger(&self, payload: &str) -> HookRun {
        crate::test_log!("TRIGGER: {}", payload);

        let start = Instant::now();
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to spawn trh");
        child
            .stdin
            .take()
            .expect("stdin is piped")
            .write_all(payload.as_bytes())
            .expect("Failed to write hook payload");
        let output = child.wait_with_output().expect("Failed to wait for trh");

        HookRun {
            output,
            elapsed: start.elapsed(),
        }
    }

    /// Run a `trh` subcommand.
    pub fn trh(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .expect("Failed to run trh")
    }

    pub fn records(&self) -> Vec<RunRecord> {
        Recorder::new(&self.layout())
            .read_recent(1000)
            .expect("Failed to read run log")
    }

    /// Poll the run log until `done` holds or `timeout` passes.
    pub fn wait_for(
        &self,
        timeout: Duration,
        done: impl Fn(&[RunRecord]) -> bool,
    ) -> Vec<RunRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.records();
            if done(&records) || Instant::now() >= deadline {
                return records;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Wait for the detached run to record its result and drop the lock.
    pub fn wait_for_run(&self, timeout: Duration) -> RunRecord {
        let lock_path = self.layout().lock_path();
        let records = self.wait_for(timeout, |records| {
            records.iter().any(is_run_result) && !lock_path.exists()
        });
        crate::test_log!("RECORDS: {:?}", records);
        records
            .into_iter()
            .rev()
            .find(is_run_result)
            .expect("No run result recorded before the deadline")
    }
}

fn is_run_result(record: &RunRecord) -> bool {
    matches!(
        record.outcome,
        Outcome::Completed | Outcome::TimedOut | Outcome::LaunchFailed
    )
}
