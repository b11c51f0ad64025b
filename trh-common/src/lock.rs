//! Project-wide run lock.
//!
//! At most one test run may be active per project. The lock is a small JSON
//! record (`holder_pid`, `acquired_at`) created with exclusive-create
//! semantics, so two hook processes can never both believe they hold it.
//! Liveness is decided by probing the recorded holder, not by the record's
//! existence: a crashed holder leaves a stale record that the next
//! acquisition reclaims.

use crate::layout::StateLayout;
use crate::process::is_process_running;
use crate::util::{atomic_write, create_exclusive, remove_if_exists};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock record error: {0}")]
    Record(#[from] serde_json::Error),

    /// The record names a different process than the one adopting it.
    #[error("lock is held by pid {holder}, not by pid {expected}")]
    NotHolder { holder: u32, expected: u32 },

    /// No record to adopt.
    #[error("lock record is missing")]
    Missing,
}

/// Contents of the lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(holder_pid: u32) -> Self {
        Self {
            holder_pid,
            acquired_at: Utc::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        is_process_running(self.holder_pid)
    }
}

/// What is currently on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Absent,
    Held(LockRecord),
    /// Present but unparseable.
    Corrupt(String),
}

/// Who holds the lock when acquisition fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    Live(LockRecord),
    /// Another process is reclaiming a stale record right now.
    Reclaiming,
    /// The record changed under us and could not be read back.
    Unknown,
}

impl Holder {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Live(record) => Some(record.holder_pid),
            Self::Reclaiming | Self::Unknown => None,
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquisition {
    Granted(RunLockGuard),
    Held(Holder),
}

/// Handle to a project's run lock.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    guard_path: PathBuf,
}

impl RunLock {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            path: layout.lock_path(),
            guard_path: layout.lock_guard_path(),
        }
    }

    /// Acquire the lock for the current process.
    pub fn acquire(&self) -> Result<Acquisition, LockError> {
        self.acquire_as(std::process::id())
    }

    /// Acquire the lock on behalf of `pid`.
    ///
    /// If a record exists and its holder is dead (or the record is garbage),
    /// the record is removed and creation is retried exactly once.
    pub fn acquire_as(&self, pid: u32) -> Result<Acquisition, LockError> {
        if let Some(guard) = self.try_create(pid)? {
            return Ok(Acquisition::Granted(guard));
        }

        match self.inspect()? {
            LockState::Held(record) if record.is_live() => {
                debug!("Run lock held by live pid {}", record.holder_pid);
                return Ok(Acquisition::Held(Holder::Live(record)));
            }
            LockState::Absent => {
                debug!("Run lock vanished before inspection, retrying");
            }
            LockState::Held(_) | LockState::Corrupt(_) => {
                if let Some(holder) = self.reclaim_stale()? {
                    return Ok(Acquisition::Held(holder));
                }
            }
        }

        match self.try_create(pid)? {
            Some(guard) => Ok(Acquisition::Granted(guard)),
            None => match self.inspect()? {
                LockState::Held(record) => Ok(Acquisition::Held(Holder::Live(record))),
                LockState::Absent | LockState::Corrupt(_) => {
                    Ok(Acquisition::Held(Holder::Unknown))
                }
            },
        }
    }

    /// Take over a lock that was handed to the current process.
    pub fn adopt(&self) -> Result<RunLockGuard, LockError> {
        let pid = std::process::id();
        match self.inspect()? {
            LockState::Held(record) if record.holder_pid == pid => Ok(RunLockGuard {
                lock: self.clone(),
                record,
                armed: true,
            }),
            LockState::Held(record) => Err(LockError::NotHolder {
                holder: record.holder_pid,
                expected: pid,
            }),
            LockState::Absent | LockState::Corrupt(_) => Err(LockError::Missing),
        }
    }

    /// Read the current record without changing anything.
    pub fn inspect(&self) -> Result<LockState, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<LockRecord>(&text) {
                Ok(record) => Ok(LockState::Held(record)),
                Err(_) => Ok(LockState::Corrupt(text)),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the lock record. Missing records are fine.
    pub fn release(&self) -> Result<(), LockError> {
        if remove_if_exists(&self.path)? {
            debug!("Released run lock {:?}", self.path);
        }
        Ok(())
    }

    fn try_create(&self, pid: u32) -> Result<Option<RunLockGuard>, LockError> {
        let record = LockRecord::new(pid);
        let json = serde_json::to_vec(&record)?;
        match create_exclusive(&self.path, &json) {
            Ok(()) => {
                debug!("Acquired run lock for pid {}", pid);
                Ok(Some(RunLockGuard {
                    lock: self.clone(),
                    record,
                    armed: true,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stale record under the reclaim guard.
    ///
    /// Returns `Some(holder)` if the lock turned out to be legitimately held.
    fn reclaim_stale(&self) -> Result<Option<Holder>, LockError> {
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard_path)?;

        if let Err(e) = guard.try_lock_exclusive() {
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                debug!("Another process is reclaiming the run lock");
                return Ok(Some(Holder::Reclaiming));
            }
            return Err(e.into());
        }

        // Re-read under the guard: only the record we judged stale may go.
        match self.inspect()? {
            LockState::Absent => Ok(None),
            LockState::Held(record) if record.is_live() => Ok(Some(Holder::Live(record))),
            LockState::Held(record) => {
                info!(
                    "Reclaiming stale run lock from dead pid {} (acquired {})",
                    record.holder_pid, record.acquired_at
                );
                remove_if_exists(&self.path)?;
                Ok(None)
            }
            LockState::Corrupt(text) => {
                warn!("Reclaiming corrupt run lock record: {:?}", text);
                remove_if_exists(&self.path)?;
                Ok(None)
            }
        }
    }
}

/// Ownership of the run lock.
///
/// Releases the lock when dropped unless ownership was handed to another
/// process with [`RunLockGuard::transfer`].
#[derive(Debug)]
pub struct RunLockGuard {
    lock: RunLock,
    record: LockRecord,
    armed: bool,
}

impl RunLockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Hand the lock to `new_pid` with a single atomic rewrite.
    ///
    /// On success this guard no longer releases the lock; on failure it
    /// still does.
    pub fn transfer(&mut self, new_pid: u32) -> Result<(), LockError> {
        let record = LockRecord {
            holder_pid: new_pid,
            acquired_at: self.record.acquired_at,
        };
        atomic_write(&self.lock.path, &serde_json::to_vec(&record)?)?;
        debug!(
            "Handed run lock from pid {} to pid {}",
            self.record.holder_pid, new_pid
        );
        self.record = record;
        self.armed = false;
        Ok(())
    }

    /// Release the lock now.
    pub fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        self.lock.release()
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = self.lock.release()
        {
            warn!("Failed to release run lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn lock() -> (TempDir, StateLayout, RunLock) {
        let tmp = TempDir::new().unwrap();
        let layout = StateLayout::new(tmp.path());
        layout.ensure().unwrap();
        let lock = RunLock::new(&layout);
        (tmp, layout, lock)
    }

    fn granted(acquisition: Acquisition) -> RunLockGuard {
        match acquisition {
            Acquisition::Granted(guard) => guard,
            Acquisition::Held(holder) => panic!("expected grant, held by {:?}", holder),
        }
    }

    fn write_record(layout: &StateLayout, pid: u32) {
        let record = LockRecord::new(pid);
        fs::write(layout.lock_path(), serde_json::to_vec(&record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_writes_record_with_pid() {
        let (_tmp, _layout, lock) = lock();
        let guard = granted(lock.acquire().unwrap());
        match lock.inspect().unwrap() {
            LockState::Held(record) => {
                assert_eq!(record.holder_pid, std::process::id());
                assert_eq!(&record, guard.record());
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_second_acquire_sees_live_holder() {
        let (_tmp, _layout, lock) = lock();
        let _guard = granted(lock.acquire().unwrap());
        match lock.acquire().unwrap() {
            Acquisition::Held(holder) => assert_eq!(holder.pid(), Some(std::process::id())),
            Acquisition::Granted(_) => panic!("lock granted twice"),
        }
    }

    #[test]
    fn test_guard_drop_releases() {
        let (_tmp, layout, lock) = lock();
        {
            let _guard = granted(lock.acquire().unwrap());
            assert!(layout.lock_path().exists());
        }
        assert!(!layout.lock_path().exists());
        let _again = granted(lock.acquire().unwrap());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (_tmp, layout, lock) = lock();
        let guard = granted(lock.acquire().unwrap());
        guard.release().unwrap();
        assert!(!layout.lock_path().exists());
        lock.release().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn test_stale_lock_from_dead_process_is_reclaimed() {
        let (_tmp, layout, lock) = lock();
        write_record(&layout, 999_999_999);
        let guard = granted(lock.acquire().unwrap());
        assert_eq!(guard.record().holder_pid, std::process::id());
    }

    #[test]
    fn test_corrupt_lock_is_reclaimed() {
        let (_tmp, layout, lock) = lock();
        fs::write(layout.lock_path(), "{garbage").unwrap();
        assert!(matches!(lock.inspect().unwrap(), LockState::Corrupt(_)));
        let _guard = granted(lock.acquire().unwrap());
    }

    #[test]
    fn test_reclaim_in_progress_reports_held() {
        let (_tmp, layout, lock) = lock();
        write_record(&layout, 999_999_999);
        let reclaimer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(layout.lock_guard_path())
            .unwrap();
        reclaimer.try_lock_exclusive().unwrap();

        match lock.acquire().unwrap() {
            Acquisition::Held(Holder::Reclaiming) => {}
            other => panic!("expected reclaiming holder, got {:?}", other),
        }
        // The stale record is left for the reclaimer.
        assert!(layout.lock_path().exists());
    }

    #[test]
    fn test_transfer_hands_off_without_release() {
        let (_tmp, layout, lock) = lock();
        let mut guard = granted(lock.acquire().unwrap());
        let acquired_at = guard.record().acquired_at;
        guard.transfer(4242).unwrap();
        drop(guard);

        match lock.inspect().unwrap() {
            LockState::Held(record) => {
                assert_eq!(record.holder_pid, 4242);
                assert_eq!(record.acquired_at, acquired_at);
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(layout.lock_path().exists());
    }

    #[test]
    fn test_adopt_requires_matching_holder() {
        let (_tmp, layout, lock) = lock();
        assert!(matches!(lock.adopt(), Err(LockError::Missing)));

        write_record(&layout, 1);
        assert!(matches!(
            lock.adopt(),
            Err(LockError::NotHolder { holder: 1, .. })
        ));

        lock.release().unwrap();
        write_record(&layout, std::process::id());
        let guard = lock.adopt().unwrap();
        drop(guard);
        assert!(!layout.lock_path().exists());
    }

    #[test]
    fn test_concurrent_acquisition_grants_exactly_one() {
        let (_tmp, layout, _lock) = lock();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let lock = RunLock::new(&layout);
                std::thread::spawn(move || {
                    barrier.wait();
                    match lock.acquire().unwrap() {
                        // Keep the record in place so later threads see it.
                        Acquisition::Granted(mut guard) => {
                            guard.transfer(std::process::id()).unwrap();
                            true
                        }
                        Acquisition::Held(_) => false,
                    }
                })
            })
            .collect();

        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(grants, 1);
    }

    #[test]
    fn test_concurrent_reclaim_of_stale_lock_grants_exactly_one() {
        let (_tmp, layout, _lock) = lock();
        write_record(&layout, 999_999_999);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let lock = RunLock::new(&layout);
                std::thread::spawn(move || {
                    barrier.wait();
                    match lock.acquire().unwrap() {
                        Acquisition::Granted(mut guard) => {
                            guard.transfer(std::process::id()).unwrap();
                            true
                        }
                        Acquisition::Held(_) => false,
                    }
                })
            })
            .collect();

        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(grants, 1);
    }
}
