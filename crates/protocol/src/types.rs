//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tools whose successful use changes files on disk.
pub const FILE_EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Tools that spawn a sub-task (subagent).
pub const SUBAGENT_TOOLS: &[&str] = &["Task", "Agent"];

/// System message subtype carrying the list of available slash commands.
pub const COMMANDS_SUBTYPE: &str = "commands";

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
    WaitingForApproval,
    Completed,
    Interrupted,
    Error,
    /// No live registry entry, only an on-disk log.
    History,
}

impl SessionStatus {
    /// Completed, interrupted and error are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Interrupted | SessionStatus::Error
        )
    }

    /// An invocation is in flight.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::WaitingForApproval
        )
    }
}

/// Tool permission mode passed through to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" => Some(PermissionMode::Default),
            "acceptEdits" => Some(PermissionMode::AcceptEdits),
            "plan" => Some(PermissionMode::Plan),
            "bypassPermissions" => Some(PermissionMode::BypassPermissions),
            _ => None,
        }
    }
}

/// Kind of a normalized message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    ToolUse,
    ToolResult,
    Result,
    Error,
}

/// A provider-independent message record.
///
/// The router treats these as opaque ordered records. `index` is always
/// re-stamped by the router from the position in its message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    #[serde(default)]
    pub index: usize,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub content: Value,
    /// Finalized reasoning segment attached to an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl NormalizedMessage {
    pub fn new(kind: MessageKind, content: Value) -> Self {
        Self {
            index: 0,
            kind,
            id: None,
            subtype: None,
            content,
            reasoning: None,
            tool_name: None,
            tool_use_id: None,
            parent_tool_use_id: None,
            is_error: None,
            cwd: None,
            timestamp: None,
        }
    }

    /// Plain text message of the given kind.
    pub fn text(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(kind, Value::String(text.into()))
    }

    /// The finalized reasoning segment, if this is an assistant message carrying one.
    pub fn finalized_reasoning(&self) -> Option<&str> {
        if self.kind != MessageKind::Assistant {
            return None;
        }
        self.reasoning.as_deref().filter(|r| !r.is_empty())
    }

    /// System message enumerating available commands.
    pub fn is_command_listing(&self) -> bool {
        self.kind == MessageKind::System && self.subtype.as_deref() == Some(COMMANDS_SUBTYPE)
    }

    /// Command names carried by a command listing message.
    pub fn commands(&self) -> Vec<String> {
        self.content
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A tool use that changes files on disk.
    pub fn touches_files(&self) -> bool {
        self.kind == MessageKind::ToolUse
            && self
                .tool_name
                .as_deref()
                .is_some_and(|name| FILE_EDIT_TOOLS.contains(&name))
    }
}

/// One tool call made inside a sub-task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentToolCall {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// An active sub-task, keyed by the tool-use id that spawned it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTask {
    pub tool_use_id: String,
    pub description: String,
    pub subagent_type: String,
    #[serde(default)]
    pub tool_calls: Vec<SubagentToolCall>,
    pub started_at: String,
}

/// Context-window usage snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub context_window: u64,
}

impl ContextUsage {
    /// Calculate context fill percentage
    pub fn context_fill_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        ((self.input_tokens + self.cached_tokens) as f64 / self.context_window as f64) * 100.0
    }
}

/// Per-file line counts of a working-tree diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffFileStat {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
}

/// Repository diff snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitDiffSnapshot {
    pub files: Vec<DiffFileStat>,
    pub total_additions: u64,
    pub total_deletions: u64,
    pub computed_at: String,
}

/// Status of a sideband task item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// Task list entry extracted from a session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    pub content: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// Summary of a live session for list views
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub provider: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: String,
    pub has_pending_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_and_busy_statuses_are_disjoint() {
        for status in [
            SessionStatus::Idle,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingForApproval,
            SessionStatus::Completed,
            SessionStatus::Interrupted,
            SessionStatus::Error,
            SessionStatus::History,
        ] {
            assert!(!(status.is_terminal() && status.is_busy()), "{status:?}");
        }
        assert!(SessionStatus::Interrupted.is_terminal());
        assert!(SessionStatus::WaitingForApproval.is_busy());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::WaitingForApproval).unwrap();
        assert_eq!(json, "\"waiting_for_approval\"");
    }

    #[test]
    fn finalized_reasoning_only_for_assistant() {
        let mut msg = NormalizedMessage::text(MessageKind::Assistant, "hi");
        assert_eq!(msg.finalized_reasoning(), None);
        msg.reasoning = Some("thought".into());
        assert_eq!(msg.finalized_reasoning(), Some("thought"));
        msg.kind = MessageKind::User;
        assert_eq!(msg.finalized_reasoning(), None);
    }

    #[test]
    fn command_listing_exposes_command_names() {
        let mut msg = NormalizedMessage::new(MessageKind::System, json!(["/clear", "/compact", 3]));
        msg.subtype = Some(COMMANDS_SUBTYPE.into());
        assert!(msg.is_command_listing());
        assert_eq!(msg.commands(), vec!["/clear", "/compact"]);
    }

    #[test]
    fn edit_tool_use_touches_files() {
        let mut msg = NormalizedMessage::new(MessageKind::ToolUse, json!({"file_path": "a.rs"}));
        msg.tool_name = Some("Edit".into());
        assert!(msg.touches_files());
        msg.tool_name = Some("Read".into());
        assert!(!msg.touches_files());
    }

    #[test]
    fn message_index_defaults_when_missing() {
        let msg: NormalizedMessage =
            serde_json::from_value(json!({"kind": "user", "content": "hello"})).unwrap();
        assert_eq!(msg.index, 0);
        assert_eq!(msg.content, json!("hello"));
    }

    #[test]
    fn permission_mode_round_trips_through_cli_names() {
        for mode in [
            PermissionMode::Default,
            PermissionMode::AcceptEdits,
            PermissionMode::Plan,
            PermissionMode::BypassPermissions,
        ] {
            assert_eq!(PermissionMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PermissionMode::parse("yolo"), None);
    }
}
