//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Where a status frame originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// A live registry session driven by the runner
    Api,
    /// A session known only from its on-disk log
    History,
}

/// Frames sent from server to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // Message log
    Message {
        message: NormalizedMessage,
    },
    ReplayComplete {
        total_messages: usize,
        oldest_index: usize,
    },
    Tasks {
        tasks: Vec<TaskItem>,
    },

    // Lifecycle
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        source: StatusSource,
    },
    SessionRedirected {
        new_session_id: String,
    },
    ToolApprovalRequest {
        tool_name: String,
        tool_use_id: String,
        input: Value,
    },
    AvailableCommands {
        commands: Vec<String>,
    },

    // Ephemeral state
    ThinkingDelta {
        text: String,
    },
    PermissionMode {
        mode: PermissionMode,
    },
    Compacting {
        is_compacting: bool,
    },
    ContextUsage {
        usage: ContextUsage,
    },
    GitDiff {
        diff: GitDiffSnapshot,
    },
    SubagentStarted {
        tool_use_id: String,
        description: String,
        subagent_type: String,
        started_at: String,
    },
    SubagentToolCall {
        parent_tool_use_id: String,
        call: SubagentToolCall,
    },
    SubagentCompleted {
        tool_use_id: String,
    },

    // Transport
    Ping,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Status frame for a live session.
    pub fn status(status: SessionStatus, error: Option<String>) -> Self {
        ServerMessage::Status {
            status,
            error,
            source: StatusSource::Api,
        }
    }

    /// A status frame reporting a terminal lifecycle status.
    pub fn is_terminal_status(&self) -> bool {
        matches!(self, ServerMessage::Status { status, .. } if status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compacting_uses_camel_case_field() {
        let json = serde_json::to_value(ServerMessage::Compacting {
            is_compacting: true,
        })
        .unwrap();
        assert_eq!(json, json!({"type": "compacting", "isCompacting": true}));
    }

    #[test]
    fn replay_complete_shape() {
        let json = serde_json::to_value(ServerMessage::ReplayComplete {
            total_messages: 3,
            oldest_index: 1,
        })
        .unwrap();
        assert_eq!(
            json,
            json!({"type": "replay_complete", "totalMessages": 3, "oldestIndex": 1})
        );
    }

    #[test]
    fn status_omits_missing_error() {
        let json = serde_json::to_value(ServerMessage::status(SessionStatus::Running, None)).unwrap();
        assert_eq!(
            json,
            json!({"type": "status", "status": "running", "source": "api"})
        );

        let json = serde_json::to_value(ServerMessage::status(
            SessionStatus::Error,
            Some("boom".into()),
        ))
        .unwrap();
        assert_eq!(json["error"], json!("boom"));
    }

    #[test]
    fn redirect_and_ping_shapes() {
        let json = serde_json::to_value(ServerMessage::SessionRedirected {
            new_session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            json!({"type": "session_redirected", "newSessionId": "abc"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn terminal_status_detection() {
        assert!(ServerMessage::status(SessionStatus::Completed, None).is_terminal_status());
        assert!(!ServerMessage::status(SessionStatus::Running, None).is_terminal_status());
        assert!(!ServerMessage::Ping.is_terminal_status());
    }
}
