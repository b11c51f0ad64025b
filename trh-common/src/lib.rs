//! Shared engine for the trh background test-runner hook.
//!
//! The hook binary is a thin shell around these pieces:
//! configuration is resolved from the environment, a debounce gate and a
//! project-wide run lock coordinate independent hook processes through the
//! filesystem, and the launcher runs the test command under a timeout and
//! appends the result to the project's run log.

pub mod config;
pub mod debounce;
pub mod launcher;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod record;
pub mod recorder;
mod util;

pub use config::{Configuration, DisabledReason, Resolution, Resolved};
pub use debounce::{DebounceGate, GateDecision};
pub use launcher::{LaunchSpec, Launcher};
pub use layout::StateLayout;
pub use lock::{Acquisition, Holder, LockError, LockRecord, LockState, RunLock, RunLockGuard};
pub use logging::{LogConfig, LoggingGuard, init_logging};
pub use protocol::{HookInput, TriggerEvent};
pub use record::{Outcome, RunRecord};
pub use recorder::Recorder;

/// Crate version, reported by `trh status`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
