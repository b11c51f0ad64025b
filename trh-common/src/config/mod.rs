//! Configuration resolution for the test-runner hook.
//!
//! A [`Configuration`] is resolved once per invocation from the environment
//! and passed down explicitly; inner components never read the environment
//! themselves. Resolution is pure: it has no side effects and never fails.
//! Malformed values fall back to their defaults, and a missing command or an
//! explicit `CLAUDE_TEST_ENABLED=0` yields [`Resolution::Disabled`].

pub mod env;
pub mod source;

pub use env::{ENV_PREFIX, EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DEBOUNCE_SECS: u64 = 5;
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 64 * 1024;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MIN_OUTPUT_BYTES: u64 = 1024;
const MAX_OUTPUT_BYTES: u64 = 16 * 1024 * 1024;
const MAX_KILL_GRACE_MS: u64 = 60_000;

/// Snapshot of the hook settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Configuration {
    /// Shell command that runs the project's tests.
    pub command: Sourced<String>,
    pub timeout_seconds: Sourced<u64>,
    pub debounce_seconds: Sourced<u64>,
    pub max_output_bytes: Sourced<u64>,
    /// Grace period between SIGTERM and SIGKILL on timeout.
    pub kill_grace_ms: Sourced<u64>,
    pub log_level: Sourced<String>,
}

impl Configuration {
    /// Configuration with defaults for everything but the command.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: Sourced::default_value(command.into()),
            timeout_seconds: Sourced::default_value(DEFAULT_TIMEOUT_SECS),
            debounce_seconds: Sourced::default_value(DEFAULT_DEBOUNCE_SECS),
            max_output_bytes: Sourced::default_value(DEFAULT_MAX_OUTPUT_BYTES),
            kill_grace_ms: Sourced::default_value(DEFAULT_KILL_GRACE_MS),
            log_level: Sourced::default_value(DEFAULT_LOG_LEVEL.to_string()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.value)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds.value)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms.value)
    }

    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output_bytes.value).unwrap_or(usize::MAX)
    }
}

/// Why the engine is switched off for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    /// `CLAUDE_TEST_ENABLED` is false.
    Switched,
    /// `CLAUDE_TEST_COMMAND` is unset or blank.
    NoCommand,
}

impl std::fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Switched => write!(f, "disabled by {}ENABLED", ENV_PREFIX),
            Self::NoCommand => write!(f, "no {}COMMAND configured", ENV_PREFIX),
        }
    }
}

/// Outcome of configuration resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Enabled(Configuration),
    Disabled(DisabledReason),
}

/// Resolution result plus any problems found along the way.
#[derive(Debug)]
pub struct Resolved {
    pub resolution: Resolution,
    pub warnings: Vec<EnvError>,
}

/// Resolve the configuration from the process environment.
pub fn resolve() -> Resolved {
    resolve_with(EnvParser::new())
}

/// Resolve the configuration from the given parser.
pub fn resolve_with(mut parser: EnvParser) -> Resolved {
    let enabled = parser.get_bool("ENABLED", true);
    let command = parser.get_optional_string("COMMAND");
    let timeout_seconds =
        parser.get_u64_range("TIMEOUT", DEFAULT_TIMEOUT_SECS, 1, MAX_INTERVAL_SECS);
    let debounce_seconds =
        parser.get_u64_range("DEBOUNCE", DEFAULT_DEBOUNCE_SECS, 1, MAX_INTERVAL_SECS);
    let max_output_bytes = parser.get_u64_range(
        "MAX_OUTPUT",
        DEFAULT_MAX_OUTPUT_BYTES,
        MIN_OUTPUT_BYTES,
        MAX_OUTPUT_BYTES,
    );
    let kill_grace_ms =
        parser.get_u64_range("KILL_GRACE_MS", DEFAULT_KILL_GRACE_MS, 0, MAX_KILL_GRACE_MS);
    let log_level = parser.get_log_level("LOG_LEVEL", DEFAULT_LOG_LEVEL);
    let warnings = parser.take_errors();

    let resolution = if !enabled.value {
        Resolution::Disabled(DisabledReason::Switched)
    } else {
        match command.value.clone() {
            Some(cmd) => Resolution::Enabled(Configuration {
                command: command.map(|_| cmd),
                timeout_seconds,
                debounce_seconds,
                max_output_bytes,
                kill_grace_ms,
                log_level,
            }),
            None => Resolution::Disabled(DisabledReason::NoCommand),
        }
    };

    Resolved {
        resolution,
        warnings,
    }
}
