//! Debounce gate for bursts of file-change triggers.
//!
//! The time of the last accepted trigger is persisted as unix milliseconds in
//! the `.last_run` marker. The read-compare-write on that marker runs while
//! holding an exclusive advisory lock on a sibling guard file, and the marker
//! itself is replaced with a single rename, so two hook processes racing on
//! the same instant can never both pass the gate.

use crate::layout::StateLayout;
use crate::util::atomic_write;
use chrono::{DateTime, TimeZone, Utc};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of consulting the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// First trigger, or far enough from the previous one. `now` was persisted.
    Accepted,
    /// Too close to the previously accepted trigger.
    Debounced { last: DateTime<Utc> },
    /// Another process is passing the gate at this very moment.
    Contended,
    /// The state could not be read or written; accepted anyway.
    FailedOpen,
}

impl GateDecision {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::FailedOpen)
    }
}

/// Filesystem-backed debounce gate for one project.
#[derive(Debug, Clone)]
pub struct DebounceGate {
    marker: PathBuf,
    guard: PathBuf,
}

impl DebounceGate {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            marker: layout.debounce_path(),
            guard: layout.debounce_guard_path(),
        }
    }

    /// Decide whether a trigger at `now` may run.
    pub fn should_run(&self, now: DateTime<Utc>, debounce: Duration) -> bool {
        self.check(now, debounce).accepted()
    }

    /// Decide whether a trigger at `now` may run, with the reason.
    pub fn check(&self, now: DateTime<Utc>, debounce: Duration) -> GateDecision {
        let guard = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Debounce guard unavailable, failing open: {}", e);
                return GateDecision::FailedOpen;
            }
        };

        match guard.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                debug!("Debounce gate contended");
                return GateDecision::Contended;
            }
            Err(e) => {
                warn!("Failed to lock debounce guard, failing open: {}", e);
                return GateDecision::FailedOpen;
            }
        }

        let now_ms = now.timestamp_millis();
        let mut failed_open = false;

        match self.read_marker() {
            Ok(Some(last_ms)) => {
                // A clock that went backwards also lands here: elapsed < 0.
                let elapsed_ms = now_ms.saturating_sub(last_ms);
                let window_ms = i64::try_from(debounce.as_millis()).unwrap_or(i64::MAX);
                if elapsed_ms < window_ms {
                    let last = Utc
                        .timestamp_millis_opt(last_ms)
                        .single()
                        .unwrap_or(now);
                    return GateDecision::Debounced { last };
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to read debounce marker, failing open: {}", e);
                failed_open = true;
            }
        }

        if let Err(e) = atomic_write(&self.marker, now_ms.to_string().as_bytes()) {
            warn!("Failed to persist debounce marker: {}", e);
            failed_open = true;
        }

        // Dropping `guard` closes the handle and releases the lock.
        if failed_open {
            GateDecision::FailedOpen
        } else {
            GateDecision::Accepted
        }
    }

    /// Time of the last accepted trigger, if any.
    pub fn last_trigger(&self) -> Option<DateTime<Utc>> {
        let ms = self.read_marker().ok().flatten()?;
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Read the marker. A corrupt marker reads as absent.
    fn read_marker(&self) -> io::Result<Option<i64>> {
        match fs::read_to_string(&self.marker) {
            Ok(text) => match text.trim().parse::<i64>() {
                Ok(ms) => Ok(Some(ms)),
                Err(_) => {
                    warn!("Ignoring corrupt debounce marker: {:?}", text.trim());
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn gate() -> (TempDir, StateLayout, DebounceGate) {
        let tmp = TempDir::new().unwrap();
        let layout = StateLayout::new(tmp.path());
        layout.ensure().unwrap();
        let gate = DebounceGate::new(&layout);
        (tmp, layout, gate)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    const FIVE: Duration = Duration::from_secs(5);

    #[test]
    fn test_first_trigger_is_accepted_and_persisted() {
        let (_tmp, layout, gate) = gate();
        assert_eq!(gate.check(at(0), FIVE), GateDecision::Accepted);
        let stored = fs::read_to_string(layout.debounce_path()).unwrap();
        assert_eq!(stored, at(0).timestamp_millis().to_string());
        assert_eq!(gate.last_trigger(), Some(at(0)));
    }

    #[test]
    fn test_triggers_inside_window_are_debounced() {
        let (_tmp, _layout, gate) = gate();
        assert!(gate.should_run(at(0), FIVE));
        for offset in 1..5 {
            assert_eq!(
                gate.check(at(offset), FIVE),
                GateDecision::Debounced { last: at(0) },
                "offset {}",
                offset
            );
        }
        // Rejected triggers do not move the window.
        assert_eq!(gate.last_trigger(), Some(at(0)));
    }

    #[test]
    fn test_trigger_at_window_boundary_is_accepted() {
        let (_tmp, _layout, gate) = gate();
        assert!(gate.should_run(at(0), FIVE));
        assert!(gate.should_run(at(5), FIVE));
        assert!(!gate.should_run(at(9), FIVE));
        assert!(gate.should_run(at(10), FIVE));
    }

    #[test]
    fn test_clock_going_backwards_is_rejected_without_rewinding() {
        let (_tmp, _layout, gate) = gate();
        assert!(gate.should_run(at(100), FIVE));
        assert!(!gate.should_run(at(10), FIVE));
        assert_eq!(gate.last_trigger(), Some(at(100)));
    }

    #[test]
    fn test_corrupt_marker_is_treated_as_absent() {
        let (_tmp, layout, gate) = gate();
        fs::write(layout.debounce_path(), "not-a-timestamp").unwrap();
        assert_eq!(gate.check(at(0), FIVE), GateDecision::Accepted);
        assert_eq!(gate.last_trigger(), Some(at(0)));
    }

    #[test]
    fn test_unusable_state_dir_fails_open() {
        let tmp = TempDir::new().unwrap();
        // State dir path is occupied by a regular file.
        let blocker = tmp.path().join(".claude");
        fs::write(&blocker, "file").unwrap();
        let gate = DebounceGate::new(&StateLayout::new(tmp.path()));
        assert_eq!(gate.check(at(0), FIVE), GateDecision::FailedOpen);
        assert!(gate.should_run(at(1), FIVE));
    }

    #[test]
    fn test_held_guard_rejects_as_contended() {
        let (_tmp, layout, gate) = gate();
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(layout.debounce_guard_path())
            .unwrap();
        holder.try_lock_exclusive().unwrap();

        assert_eq!(gate.check(at(0), FIVE), GateDecision::Contended);
        assert!(!GateDecision::Contended.accepted());

        drop(holder);
        assert_eq!(gate.check(at(0), FIVE), GateDecision::Accepted);
    }

    #[test]
    fn test_concurrent_triggers_admit_exactly_one() {
        let (_tmp, layout, _gate) = gate();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let gate = DebounceGate::new(&layout);
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.check(at(0), FIVE)
                })
            })
            .collect();

        let decisions: Vec<GateDecision> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = decisions.iter().filter(|d| d.accepted()).count();
        assert_eq!(accepted, 1, "decisions: {:?}", decisions);
    }
}
