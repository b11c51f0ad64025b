//! PostToolUse hook implementation.
//!
//! Handles one hook invocation from Claude Code: decides whether the edit
//! should trigger a test run and, if so, starts a detached `trh run` process
//! that owns the run lock, then returns without waiting for it.

use anyhow::Context;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use trh_common::config::{self, Configuration, DisabledReason, Resolution, Resolved};
use trh_common::{
    Acquisition, DebounceGate, GateDecision, Holder, LogConfig, LoggingGuard, Outcome, Recorder,
    RunLock, RunRecord, StateLayout, TriggerEvent, init_logging,
};

/// Upper bound on the hook payload read from stdin.
const MAX_INPUT_BYTES: u64 = 10 * 1024 * 1024;

/// How long the caller gets to deliver the payload and close stdin.
const INPUT_TIMEOUT: Duration = Duration::from_secs(3);

/// Written to the runner's stdin once it owns the lock.
pub(crate) const HANDOFF_TOKEN: &[u8] = b"trh-handoff\n";

/// Terminal state of one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Disabled(DisabledReason),
    /// The tool does not modify files.
    Ignored(String),
    Debounced,
    LockHeld(Holder),
    Launched { pid: u32 },
    LaunchFailed,
}

/// Starts the detached half of a test run.
pub trait RunnerSpawner {
    type Runner: DetachedRunner;

    fn spawn(&self, project_dir: &Path, trigger: &TriggerEvent) -> io::Result<Self::Runner>;
}

/// A started runner that has not been handed the lock yet.
pub trait DetachedRunner {
    fn pid(&self) -> u32;

    /// Tell the runner it now owns the lock.
    fn hand_off(&mut self) -> io::Result<()>;

    /// Kill a runner that must not proceed.
    fn abort(self);
}

/// Spawns `trh run` from the current executable.
#[derive(Debug, Clone)]
pub struct SelfSpawner {
    exe: PathBuf,
}

impl SelfSpawner {
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }
}

impl RunnerSpawner for SelfSpawner {
    type Runner = Child;

    fn spawn(&self, project_dir: &Path, trigger: &TriggerEvent) -> io::Result<Child> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("run").arg("--project-dir").arg(project_dir);
        if let Some(tool) = &trigger.tool_name {
            cmd.arg("--tool").arg(tool);
        }
        if let Some(file) = &trigger.file_path {
            cmd.arg("--file").arg(file);
        }
        cmd.current_dir(project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group: signals aimed at the agent's group miss the run.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn()
    }
}

impl DetachedRunner for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn hand_off(&mut self) -> io::Result<()> {
        // Taken so that it is dropped, closing the pipe, on return.
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "runner stdin not piped"))?;
        stdin.write_all(HANDOFF_TOKEN)?;
        stdin.flush()
    }

    fn abort(mut self) {
        if let Err(e) = self.kill() {
            debug!("Failed to kill runner {}: {}", self.id(), e);
        }
        let _ = self.wait();
    }
}

/// Run the hook, reading the payload from stdin.
///
/// The logging guard comes back on every path, errors included, and must
/// outlive every log call.
pub async fn run_hook() -> (anyhow::Result<HookOutcome>, Option<LoggingGuard>) {
    let raw = read_input(tokio::io::stdin(), INPUT_TIMEOUT).await;
    handle_payload(&raw, config::resolve(), SelfSpawner::current)
}

/// Everything after the payload is read.
fn handle_payload<S, F>(
    raw: &str,
    resolved: Resolved,
    spawner: F,
) -> (anyhow::Result<HookOutcome>, Option<LoggingGuard>)
where
    S: RunnerSpawner,
    F: FnOnce() -> io::Result<S>,
{
    let config = match resolved.resolution {
        Resolution::Enabled(config) => config,
        Resolution::Disabled(reason) => return (Ok(HookOutcome::Disabled(reason)), None),
    };

    let trigger = TriggerEvent::parse(raw, chrono::Utc::now());
    if !trigger.is_file_change() {
        let tool = trigger.tool_name.unwrap_or_default();
        return (Ok(HookOutcome::Ignored(tool)), None);
    }

    let project_dir = match &trigger.cwd {
        Some(cwd) => cwd.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                let error = anyhow::Error::new(e).context("Failed to determine project directory");
                return (Err(error), None);
            }
        },
    };
    let layout = StateLayout::new(project_dir);
    // On failure keep going: the gate fails open and the recorder has a fallback.
    let state_dir_error = layout.ensure().err();

    let logging = init_logging(
        &LogConfig::new(config.log_level.value.clone()).with_file(layout.diagnostic_log_path()),
    )
    .ok();
    if let Some(e) = state_dir_error {
        warn!("Cannot create state directory {:?}: {}", layout.state_dir(), e);
    }
    for warning in &resolved.warnings {
        warn!("{}", warning);
    }
    debug!(
        tool = ?trigger.tool_name,
        file = ?trigger.file_path,
        session = ?trigger.session_id,
        "Hook triggered"
    );

    let outcome = spawner()
        .context("Failed to locate trh executable")
        .map(|spawner| HookEngine::new(config, layout, spawner).handle(&trigger));
    (outcome, logging)
}

/// Read the payload, capped in size and time.
///
/// Unreadable input is treated as empty. A caller that never closes the
/// pipe gets whatever arrived before the deadline.
async fn read_input<R: AsyncRead + Unpin>(reader: R, timeout: Duration) -> String {
    let mut buf = Vec::new();
    match tokio::time::timeout(timeout, reader.take(MAX_INPUT_BYTES).read_to_end(&mut buf)).await
    {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!("Failed to read hook input: {}", e),
        Err(_) => debug!("Hook input still open after {:?}, using {} bytes", timeout, buf.len()),
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// The hook's decision pipeline for one resolved configuration.
pub struct HookEngine<S> {
    config: Configuration,
    layout: StateLayout,
    recorder: Recorder,
    spawner: S,
}

impl<S: RunnerSpawner> HookEngine<S> {
    pub fn new(config: Configuration, layout: StateLayout, spawner: S) -> Self {
        let recorder = Recorder::new(&layout);
        Self {
            config,
            layout,
            recorder,
            spawner,
        }
    }

    /// Gate, lock, and launch. Never blocks on the test command.
    pub fn handle(&self, trigger: &TriggerEvent) -> HookOutcome {
        let gate = DebounceGate::new(&self.layout);
        match gate.check(trigger.timestamp, self.config.debounce()) {
            GateDecision::Accepted => {}
            GateDecision::FailedOpen => debug!("Debounce state unusable, proceeding"),
            GateDecision::Debounced { last } => {
                info!("Trigger debounced (last accepted at {})", last);
                self.record(trigger, RunRecord::skipped(trigger.timestamp, Outcome::Debounced));
                return HookOutcome::Debounced;
            }
            GateDecision::Contended => {
                info!("Trigger debounced (concurrent trigger in progress)");
                self.record(trigger, RunRecord::skipped(trigger.timestamp, Outcome::Debounced));
                return HookOutcome::Debounced;
            }
        }

        let lock = RunLock::new(&self.layout);
        let mut guard = match lock.acquire() {
            Ok(Acquisition::Granted(guard)) => guard,
            Ok(Acquisition::Held(holder)) => {
                info!("Test run already in progress (holder pid {:?})", holder.pid());
                self.record(trigger, RunRecord::skipped(trigger.timestamp, Outcome::LockHeld));
                return HookOutcome::LockHeld(holder);
            }
            Err(e) => {
                warn!("Failed to acquire run lock: {}", e);
                return self.launch_failed(trigger, format!("failed to acquire run lock: {}", e));
            }
        };

        let mut runner = match self.spawner.spawn(self.layout.project_dir(), trigger) {
            Ok(runner) => runner,
            Err(e) => {
                warn!("Failed to spawn detached runner: {}", e);
                // `guard` drops here and releases the lock.
                return self.launch_failed(trigger, format!("failed to start runner: {}", e));
            }
        };
        let pid = runner.pid();

        if let Err(e) = guard.transfer(pid) {
            warn!("Failed to hand run lock to pid {}: {}", pid, e);
            runner.abort();
            return self.launch_failed(trigger, format!("failed to hand off run lock: {}", e));
        }

        if let Err(e) = runner.hand_off() {
            warn!("Failed to signal runner {}: {}", pid, e);
            runner.abort();
            if let Err(e) = lock.release() {
                warn!("Failed to release run lock: {}", e);
            }
            return self.launch_failed(trigger, format!("failed to signal runner: {}", e));
        }

        info!("Started test run in pid {}", pid);
        HookOutcome::Launched { pid }
    }

    fn launch_failed(&self, trigger: &TriggerEvent, message: String) -> HookOutcome {
        self.record(trigger, RunRecord::launch_failed(trigger.timestamp, message));
        HookOutcome::LaunchFailed
    }

    fn record(&self, trigger: &TriggerEvent, record: RunRecord) {
        let record = record.with_trigger(trigger.tool_name.clone(), trigger.file_path.clone());
        self.recorder.record(&record);
    }
}
