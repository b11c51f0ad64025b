//! Detached half of a test run.
//!
//! Started by the hook as `trh run`, in its own process group with stdout
//! and stderr closed. The runner owns the run lock only after the hook has
//! rewritten it to the runner's pid and written the handoff token to stdin.

use crate::hook::HANDOFF_TOKEN;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use trh_common::config::{self, Resolution};
use trh_common::{
    LaunchSpec, Launcher, LogConfig, LoggingGuard, Recorder, RunLock, RunRecord, StateLayout,
    init_logging,
};

/// How long to wait for the hook to hand over the lock.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments passed from the hook.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub project_dir: PathBuf,
    pub tool_name: Option<String>,
    pub file_path: Option<String>,
}

/// Wait for the handoff, run the command, record, release.
pub async fn run_detached(args: RunArgs) -> Option<LoggingGuard> {
    let layout = StateLayout::new(&args.project_dir);
    let resolved = config::resolve();
    let level = match &resolved.resolution {
        Resolution::Enabled(config) => config.log_level.value.clone(),
        Resolution::Disabled(_) => config::DEFAULT_LOG_LEVEL.to_string(),
    };
    let logging =
        init_logging(&LogConfig::new(level).with_file(layout.diagnostic_log_path())).ok();

    let recorder = Recorder::new(&layout);
    let failed = |message: String| {
        warn!("{}", message);
        recorder.record(
            &RunRecord::launch_failed(chrono::Utc::now(), message)
                .with_trigger(args.tool_name.clone(), args.file_path.clone()),
        );
    };

    if !await_handoff(tokio::io::stdin(), HANDOFF_TIMEOUT).await {
        // The lock was never ours; leave it alone.
        failed("runner started without a lock handoff".to_string());
        return logging;
    }

    let guard = match RunLock::new(&layout).adopt() {
        Ok(guard) => guard,
        Err(e) => {
            failed(format!("runner could not adopt run lock: {}", e));
            return logging;
        }
    };
    info!(
        "Runner {} adopted run lock for {:?}",
        guard.record().holder_pid,
        layout.project_dir()
    );

    let config = match resolved.resolution {
        Resolution::Enabled(config) => config,
        Resolution::Disabled(reason) => {
            failed(format!("runner configuration unavailable: {}", reason));
            if let Err(e) = guard.release() {
                warn!("Failed to release run lock: {}", e);
            }
            return logging;
        }
    };

    let launcher = Launcher::new(
        LaunchSpec::from_config(&config, layout.project_dir()),
        recorder,
    );
    launcher.run(guard, args.tool_name, args.file_path).await;
    logging
}

/// Whether the handoff token arrived before `timeout`.
async fn await_handoff<R: AsyncRead + Unpin>(mut reader: R, timeout: Duration) -> bool {
    let mut token = vec![0u8; HANDOFF_TOKEN.len()];
    match tokio::time::timeout(timeout, reader.read_exact(&mut token)).await {
        Ok(Ok(_)) => token == HANDOFF_TOKEN,
        Ok(Err(e)) => {
            warn!("Handoff channel closed: {}", e);
            false
        }
        Err(_) => {
            warn!("No handoff within {:?}", timeout);
            false
        }
    }
}
