//! Test command execution with bounded output and a hard timeout.
//!
//! The command runs under `sh -c` in its own process group so that a timeout
//! can take down everything it spawned, not just the shell. Standard output
//! and standard error are drained concurrently into one shared tail buffer
//! capped at `max_output_bytes`; older bytes are discarded first because test
//! summaries are printed last.

use crate::config::{Configuration, DEFAULT_KILL_GRACE_MS, DEFAULT_MAX_OUTPUT_BYTES};
use crate::lock::RunLockGuard;
use crate::record::{Outcome, RunRecord};
use crate::recorder::Recorder;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep draining pipes after the command is gone.
///
/// Bounds the wait when an escaped grandchild keeps a pipe open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Words `sh` runs itself, without a PATH lookup.
#[cfg(unix)]
const SHELL_BUILTINS: &[&str] = &[
    ":", ".", "!", "alias", "bg", "break", "case", "cd", "command", "continue", "echo", "eval",
    "exec", "exit", "export", "false", "fg", "for", "getopts", "hash", "if", "jobs", "kill",
    "printf", "pwd", "read", "readonly", "return", "set", "shift", "source", "test", "time",
    "times", "trap", "true", "type", "ulimit", "umask", "unset", "until", "wait", "while",
];

/// Exit code = 128 + signal number for signal-terminated commands.
#[cfg(unix)]
const EXIT_SIGNAL_BASE: i32 = 128;

/// Everything needed to run the test command once.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
}

impl LaunchSpec {
    pub fn from_config(config: &Configuration, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.value.clone(),
            working_dir: working_dir.into(),
            timeout: config.timeout(),
            kill_grace: config.kill_grace(),
            max_output_bytes: config.max_output_bytes(),
        }
    }
}

/// Runs the command, records the result, and releases the lock.
#[derive(Debug, Clone)]
pub struct Launcher {
    spec: LaunchSpec,
    recorder: Recorder,
}

impl Launcher {
    pub fn new(spec: LaunchSpec, recorder: Recorder) -> Self {
        Self { spec, recorder }
    }

    /// Execute once while holding `lock`.
    ///
    /// Every terminal path (completed, timed-out, launch-failed) records the
    /// result and then releases the lock exactly once.
    pub async fn run(
        &self,
        lock: RunLockGuard,
        tool_name: Option<String>,
        file_path: Option<String>,
    ) -> RunRecord {
        let record = execute(&self.spec).await.with_trigger(tool_name, file_path);
        info!(
            outcome = %record.outcome,
            exit_code = ?record.exit_code,
            duration_ms = record.duration_ms,
            "Test run finished"
        );
        self.recorder.record(&record);
        if let Err(e) = lock.release() {
            warn!("Failed to release run lock: {}", e);
        }
        record
    }
}

/// Run `command` in `working_dir` with default grace and output limits.
pub async fn launch(command: &str, working_dir: &Path, timeout_seconds: u64) -> RunRecord {
    execute(&LaunchSpec {
        command: command.to_string(),
        working_dir: working_dir.to_path_buf(),
        timeout: Duration::from_secs(timeout_seconds),
        kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        max_output_bytes: usize::try_from(DEFAULT_MAX_OUTPUT_BYTES).unwrap_or(usize::MAX),
    })
    .await
}

/// Run the command and classify the result. Never fails.
pub async fn execute(spec: &LaunchSpec) -> RunRecord {
    let started_at = Utc::now();
    let clock = Instant::now();

    if let Some(program) = missing_program(&spec.command, &spec.working_dir) {
        warn!("Test command program not found: {}", program);
        let mut record =
            RunRecord::launch_failed(started_at, format!("command not found: {}", program));
        record.duration_ms = elapsed_ms(clock);
        return record;
    }

    let mut child = match shell_command(spec).spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn test command: {}", e);
            let mut record =
                RunRecord::launch_failed(started_at, format!("failed to spawn shell: {}", e));
            record.duration_ms = elapsed_ms(clock);
            return record;
        }
    };
    let pid = child.id();
    debug!(pid = ?pid, "Spawned test command");

    let buffer = Arc::new(Mutex::new(TailBuffer::new(spec.max_output_bytes)));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_drain(stdout, Arc::clone(&buffer)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_drain(stderr, Arc::clone(&buffer)));
    }

    let (outcome, exit_code, duration_ms) =
        match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let duration_ms = elapsed_ms(clock);
                let (outcome, exit_code) = classify_exit(status);
                (outcome, exit_code, duration_ms)
            }
            Ok(Err(e)) => {
                warn!("Failed waiting for test command: {}", e);
                let duration_ms = elapsed_ms(clock);
                terminate(&mut child, pid, Duration::ZERO).await;
                push_note(&buffer, &format!("failed waiting for command: {}", e));
                (Outcome::LaunchFailed, None, duration_ms)
            }
            Err(_) => {
                let duration_ms = elapsed_ms(clock);
                warn!(
                    "Test command exceeded {}s timeout, terminating process group",
                    spec.timeout.as_secs()
                );
                terminate(&mut child, pid, spec.kill_grace).await;
                (Outcome::TimedOut, None, duration_ms)
            }
        };

    finish_readers(readers).await;
    let (output, truncated) = buffer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take_string();

    RunRecord {
        started_at,
        outcome,
        exit_code,
        duration_ms,
        output,
        truncated,
        tool_name: None,
        file_path: None,
    }
}

fn shell_command(spec: &LaunchSpec) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        // New process group: the shell's pid is the group id.
        cmd.process_group(0);
        cmd
    };

    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(&spec.command);
        cmd
    };

    cmd.current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    cmd
}

/// The command's leading program, if it cannot be found.
///
/// Only a plain first word is resolved. Builtins and anything the shell
/// would expand are assumed to exist, so the shell decides.
#[cfg(unix)]
fn missing_program(command: &str, working_dir: &Path) -> Option<String> {
    let program = leading_program(command)?;
    if SHELL_BUILTINS.contains(&program) {
        return None;
    }
    match which::which_in(program, std::env::var_os("PATH"), working_dir) {
        Ok(path) => {
            debug!("Resolved test program {} to {:?}", program, path);
            None
        }
        Err(_) => Some(program.to_string()),
    }
}

#[cfg(not(unix))]
fn missing_program(_command: &str, _working_dir: &Path) -> Option<String> {
    None
}

/// First word of `command` after any `NAME=value` assignments.
fn leading_program(command: &str) -> Option<&str> {
    let word = command.split_whitespace().find(|word| !is_assignment(word))?;
    let word = word
        .split([';', '&', '|', '<', '>'])
        .next()
        .unwrap_or_default();
    let expands = word.contains([
        '$', '`', '\'', '"', '\\', '(', ')', '{', '}', '*', '?', '[', '~', '=',
    ]);
    if word.is_empty() || expands {
        None
    } else {
        Some(word)
    }
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn classify_exit(status: ExitStatus) -> (Outcome, Option<i32>) {
    match status.code() {
        Some(code) => (Outcome::Completed, Some(code)),
        None => (Outcome::Completed, signal_exit_code(status)),
    }
}

#[cfg(unix)]
fn signal_exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| EXIT_SIGNAL_BASE + sig)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: ExitStatus) -> Option<i32> {
    None
}

/// Terminate the command's whole process group.
///
/// SIGTERM first, then SIGKILL after `grace` if the shell is still alive.
/// A final SIGKILL catches group members that outlived the shell.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    use crate::process::{Termination, signal_process_group};

    let Some(pgid) = pid else {
        let _ = child.kill().await;
        return;
    };

    if !grace.is_zero() {
        signal_process_group(pgid, Termination::Graceful);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!("Test command exited after SIGTERM: {}", status);
            signal_process_group(pgid, Termination::Forced);
            return;
        }
    }

    signal_process_group(pgid, Termination::Forced);
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed test command: {}", e);
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pid: Option<u32>, _grace: Duration) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill test command: {}", e);
    }
}

fn spawn_drain<R>(mut reader: R, buffer: Arc<Mutex<TailBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&chunk[..n]),
                Err(e) => {
                    debug!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

async fn finish_readers(readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            debug!("Output pipe still open after command exit, abandoning drain");
            reader.abort();
        }
    }
}

fn push_note(buffer: &Arc<Mutex<TailBuffer>>, note: &str) {
    buffer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(format!("\n[trh] {}\n", note).as_bytes());
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
    dropped: u64,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(64 * 1024)),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        // Only the tail of an oversized chunk can survive.
        let keep = if chunk.len() > self.limit {
            self.dropped += (chunk.len() - self.limit) as u64;
            &chunk[chunk.len() - self.limit..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + keep.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(keep);
    }

    fn take_string(&mut self) -> (String, bool) {
        let bytes: Vec<u8> = self.bytes.drain(..).collect();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if self.dropped > 0 {
            (
                format!("[... {} bytes truncated ...]\n{}", self.dropped, text),
                true,
            )
        } else {
            (text, false)
        }
    }
}
