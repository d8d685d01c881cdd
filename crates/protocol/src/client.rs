//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PermissionMode;

/// Frames sent from an observer to the server over a session socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start a follow-up invocation
    Prompt { text: String },
    Approve {
        tool_use_id: String,
        #[serde(default)]
        always_allow: bool,
        /// Answers to an interactive question tool, merged into the tool input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answers: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
    },
    Deny {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Interrupt,
    SetPermissionMode { mode: PermissionMode },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_approve_with_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "approve",
            "toolUseId": "toolu_1",
            "alwaysAllow": true,
            "answers": {"Which?": "A"}
        }))
        .expect("approve frame");
        match msg {
            ClientMessage::Approve {
                tool_use_id,
                always_allow,
                answers,
                updated_input,
            } => {
                assert_eq!(tool_use_id, "toolu_1");
                assert!(always_allow);
                assert_eq!(answers, Some(json!({"Which?": "A"})));
                assert_eq!(updated_input, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn approve_defaults_always_allow_to_false() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "approve", "toolUseId": "t"})).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Approve {
                always_allow: false,
                ..
            }
        ));
    }

    #[test]
    fn parses_interrupt_and_deny() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"interrupt"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Interrupt));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"deny","toolUseId":"t","message":"no"}"#).unwrap();
        match msg {
            ClientMessage::Deny {
                tool_use_id,
                message,
            } => {
                assert_eq!(tool_use_id, "t");
                assert_eq!(message.as_deref(), Some("no"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_frame_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
    }
}
