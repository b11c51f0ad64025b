//! Process liveness probes and process-group signalling.

use tracing::debug;

/// Check if a process is still running.
///
/// Probe failures other than "no such process" count as running: a holder
/// we cannot see is not a holder we may replace.
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 || i32::try_from(pid).is_err() {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: exists but belongs to someone else.
            Err(e) => {
                debug!("Liveness probe for pid {} inconclusive: {}", pid, e);
                true
            }
        }
    }

    #[cfg(not(unix))]
    {
        debug!("No liveness probe on this platform; assuming pid {} is alive", pid);
        true
    }
}

/// Signal strength used when terminating a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM: ask politely.
    Graceful,
    /// SIGKILL: no negotiation.
    Forced,
}

/// Send a termination signal to every process in the group led by `pgid`.
///
/// Returns `false` if the group no longer exists or could not be signalled.
#[cfg(unix)]
pub fn signal_process_group(pgid: u32, termination: Termination) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    if raw <= 1 {
        return false;
    }

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to send {} to process group {}: {}", signal, pgid, e);
            false
        }
    }
}
