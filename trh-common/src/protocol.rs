//! Claude Code hook protocol definitions.
//!
//! Defines the JSON structure received on stdin by the PostToolUse hook and
//! the [`TriggerEvent`] derived from it.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;

/// Tools whose completion means a file in the project changed.
pub const FILE_EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit"];

/// Input received from a Claude Code PostToolUse hook.
///
/// Every field is optional: the hook must treat anything it cannot
/// understand as a generic trigger rather than failing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    /// The tool that just ran (e.g., "Edit", "Write", "Bash").
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Tool-specific input.
    #[serde(default)]
    pub tool_input: Option<ToolInput>,
    /// Working directory of the agent session.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Optional session ID.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Tool-specific input for file-editing tools.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolInput {
    /// The file that was written or edited.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// One hook invocation's view of what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    /// `None` when the payload was empty or malformed.
    pub tool_name: Option<String>,
    pub file_path: Option<String>,
    pub cwd: Option<PathBuf>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    /// Parse a raw stdin payload.
    ///
    /// Empty or malformed input yields a generic trigger with no tool, no
    /// file, and no working directory.
    pub fn parse(raw: &str, timestamp: DateTime<Utc>) -> Self {
        let raw = raw.trim();
        let input = if raw.is_empty() {
            HookInput::default()
        } else {
            match serde_json::from_str::<HookInput>(raw) {
                Ok(input) => input,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse hook input, treating as generic trigger: {}",
                        e
                    );
                    HookInput::default()
                }
            }
        };
        Self::from_input(input, timestamp)
    }

    pub fn from_input(input: HookInput, timestamp: DateTime<Utc>) -> Self {
        Self {
            tool_name: input.tool_name.filter(|t| !t.trim().is_empty()),
            file_path: input
                .tool_input
                .and_then(|t| t.file_path)
                .filter(|p| !p.trim().is_empty()),
            cwd: input.cwd.filter(|p| !p.as_os_str().is_empty()),
            session_id: input.session_id,
            timestamp,
        }
    }

    /// Generic trigger used when no payload is available.
    pub fn generic(timestamp: DateTime<Utc>) -> Self {
        Self::from_input(HookInput::default(), timestamp)
    }

    /// Whether this event should be considered for a test run.
    ///
    /// Generic triggers (no tool name) are accepted; named tools must be one
    /// of the file-editing tools.
    pub fn is_file_change(&self) -> bool {
        match &self.tool_name {
            None => true,
            Some(tool) => FILE_EDIT_TOOLS.contains(&tool.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_parse_edit_payload() {
        let raw = r#"{"tool_name":"Edit","tool_input":{"file_path":"src/lib.rs","old_string":"a"},"cwd":"/tmp/project","session_id":"abc","hook_event_name":"PostToolUse"}"#;
        let event = TriggerEvent::parse(raw, now());
        assert_eq!(event.tool_name.as_deref(), Some("Edit"));
        assert_eq!(event.file_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(event.cwd, Some(PathBuf::from("/tmp/project")));
        assert_eq!(event.session_id.as_deref(), Some("abc"));
        assert!(event.is_file_change());
    }

    #[test]
    fn test_empty_input_is_generic_trigger() {
        let event = TriggerEvent::parse("  \n", now());
        assert_eq!(event.tool_name, None);
        assert_eq!(event.file_path, None);
        assert!(event.is_file_change());
    }

    #[test]
    fn test_malformed_input_is_generic_trigger() {
        for raw in ["{not json", "[1,2,3]", "\"Edit\"", "{\"tool_name\": 42}"] {
            let event = TriggerEvent::parse(raw, now());
            assert_eq!(event.tool_name, None, "input {:?}", raw);
            assert!(event.is_file_change());
        }
    }

    #[test]
    fn test_non_edit_tools_are_not_file_changes() {
        for tool in ["Read", "Bash", "Grep"] {
            let raw = format!(r#"{{"tool_name":"{}","tool_input":{{"command":"ls"}}}}"#, tool);
            let event = TriggerEvent::parse(&raw, now());
            assert!(!event.is_file_change(), "{} should be ignored", tool);
        }
    }

    #[test]
    fn test_write_and_multiedit_are_file_changes() {
        for tool in ["Write", "MultiEdit"] {
            let raw = format!(r#"{{"tool_name":"{}","tool_input":{{"file_path":"a.py"}}}}"#, tool);
            assert!(TriggerEvent::parse(&raw, now()).is_file_change());
        }
    }

    #[test]
    fn test_empty_file_path_is_dropped() {
        let raw = r#"{"tool_name":"Write","tool_input":{"file_path":""}}"#;
        let event = TriggerEvent::parse(raw, now());
        assert_eq!(event.file_path, None);
        assert!(event.is_file_change());
    }
}
