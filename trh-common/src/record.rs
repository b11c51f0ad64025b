//! Run records: one JSON line per handled trigger.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Terminal classification of one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Too soon after the previous accepted trigger.
    Debounced,
    /// Another run holds the project lock.
    LockHeld,
    /// The command ran to completion (any exit code).
    Completed,
    /// The command exceeded its timeout and was killed.
    TimedOut,
    /// The command could not be started.
    LaunchFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debounced => "debounced",
            Self::LockHeld => "lock-held",
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::LaunchFailed => "launch-failed",
        }
    }

    /// Whether the command itself was started.
    pub fn ran(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One line of the run log. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(serialize_with = "serialize_utc")]
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output: String,
    /// Output was cut to the configured limit.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl RunRecord {
    /// A record for a trigger that never reached the command.
    pub fn skipped(started_at: DateTime<Utc>, outcome: Outcome) -> Self {
        Self {
            started_at,
            outcome,
            exit_code: None,
            duration_ms: 0,
            output: String::new(),
            truncated: false,
            tool_name: None,
            file_path: None,
        }
    }

    /// A launch failure with a diagnostic message as output.
    pub fn launch_failed(started_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            ..Self::skipped(started_at, Outcome::LaunchFailed)
        }
    }

    /// Attach the trigger that caused this record.
    pub fn with_trigger(mut self, tool_name: Option<String>, file_path: Option<String>) -> Self {
        self.tool_name = tool_name;
        self.file_path = file_path;
        self
    }

    /// Whether the tests passed.
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_code == Some(0)
    }
}

fn serialize_utc<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn test_outcome_wire_names() {
        let names: Vec<String> = [
            Outcome::Debounced,
            Outcome::LockHeld,
            Outcome::Completed,
            Outcome::TimedOut,
            Outcome::LaunchFailed,
        ]
        .iter()
        .map(|o| serde_json::to_string(o).unwrap())
        .collect();
        assert_eq!(
            names,
            [
                "\"debounced\"",
                "\"lock-held\"",
                "\"completed\"",
                "\"timed-out\"",
                "\"launch-failed\""
            ]
        );
        assert_eq!(Outcome::TimedOut.to_string(), "timed-out");
    }

    #[test]
    fn test_record_json_shape() {
        let record = RunRecord::skipped(ts(), Outcome::Debounced)
            .with_trigger(Some("Edit".into()), Some("src/lib.rs".into()));
        let value: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["started_at"], "2026-03-14T15:09:26.000Z");
        assert_eq!(value["outcome"], "debounced");
        assert!(value["exit_code"].is_null());
        assert_eq!(value["duration_ms"], 0);
        assert_eq!(value["output"], "");
        assert_eq!(value["file_path"], "src/lib.rs");
    }

    #[test]
    fn test_launch_failed_has_no_exit_code() {
        let record = RunRecord::launch_failed(ts(), "sh: not found");
        assert_eq!(record.outcome, Outcome::LaunchFailed);
        assert_eq!(record.exit_code, None);
        assert!(!record.passed());
        assert!(!record.outcome.ran());
    }

    #[test]
    fn test_record_parses_back_from_log_line() {
        let line = r#"{"started_at":"2026-03-14T15:09:26.000Z","outcome":"completed","exit_code":0,"duration_ms":12,"output":"ok"}"#;
        let record: RunRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.started_at, ts());
        assert!(record.passed());
        assert!(!record.truncated);
    }
}
