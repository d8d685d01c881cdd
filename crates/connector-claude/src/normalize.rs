//! Claude JSON line → `NormalizedMessage`.
//!
//! Transcript lines and stream-json stdout lines share one shape, so both the
//! live connector and the transcript reader go through here.

use agentrelay_protocol::{
    ContextUsage, MessageKind, NormalizedMessage, TaskItem, TaskStatus, COMMANDS_SUBTYPE,
};
use serde_json::Value;

const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Normalize one parsed Claude line. Returns `None` for bookkeeping lines
/// (summaries, snapshots, control traffic, stream deltas).
pub fn normalize_value(raw: &Value) -> Option<NormalizedMessage> {
    let line_type = raw.get("type").and_then(|v| v.as_str())?;

    let mut message = match line_type {
        "user" => normalize_user(raw)?,
        "assistant" => normalize_assistant(raw)?,
        "system" => normalize_system(raw)?,
        "result" => normalize_result(raw),
        _ => return None,
    };

    message.id = str_field(raw, "uuid");
    message.timestamp = str_field(raw, "timestamp");
    message.cwd = str_field(raw, "cwd");
    if message.parent_tool_use_id.is_none() {
        message.parent_tool_use_id = str_field(raw, "parent_tool_use_id");
    }
    Some(message)
}

/// Parse and normalize a raw line.
pub fn normalize_line(line: &str) -> Option<NormalizedMessage> {
    let raw: Value = serde_json::from_str(line.trim()).ok()?;
    normalize_value(&raw)
}

fn normalize_user(raw: &Value) -> Option<NormalizedMessage> {
    if raw.get("isMeta").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let content = raw.get("message")?.get("content")?;

    if let Some(text) = content.as_str() {
        return Some(NormalizedMessage::text(MessageKind::User, text));
    }

    let blocks = content.as_array()?;
    let tool_result = blocks
        .iter()
        .find(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"));

    if let Some(result) = tool_result {
        let mut message = NormalizedMessage::new(MessageKind::ToolResult, content.clone());
        message.tool_use_id = str_field(result, "tool_use_id");
        message.is_error = result.get("is_error").and_then(|v| v.as_bool());
        return Some(message);
    }

    Some(NormalizedMessage::text(MessageKind::User, join_text(blocks)))
}

fn normalize_assistant(raw: &Value) -> Option<NormalizedMessage> {
    let blocks = raw.get("message")?.get("content")?.as_array()?;

    let reasoning: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("thinking"))
        .filter_map(|b| b.get("thinking").and_then(|v| v.as_str()))
        .collect();
    let reasoning = (!reasoning.is_empty()).then(|| reasoning.join("\n"));

    let tool_use = blocks
        .iter()
        .find(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_use"));

    let mut message = match tool_use {
        Some(block) => {
            let mut message = NormalizedMessage::new(
                MessageKind::ToolUse,
                block.get("input").cloned().unwrap_or(Value::Null),
            );
            message.tool_name = str_field(block, "name");
            message.tool_use_id = str_field(block, "id");
            message
        }
        None => NormalizedMessage::text(MessageKind::Assistant, join_text(blocks)),
    };

    if message.kind == MessageKind::Assistant {
        message.reasoning = reasoning;
    }
    Some(message)
}

fn normalize_system(raw: &Value) -> Option<NormalizedMessage> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");

    if subtype == "init" {
        let commands = raw.get("slash_commands")?.clone();
        let mut message = NormalizedMessage::new(MessageKind::System, commands);
        message.subtype = Some(COMMANDS_SUBTYPE.to_string());
        return Some(message);
    }

    // Status pings carry no content worth keeping in the log.
    if subtype == "status" {
        return None;
    }

    let mut message = NormalizedMessage::new(
        MessageKind::System,
        raw.get("content").cloned().unwrap_or(Value::Null),
    );
    message.subtype = (!subtype.is_empty()).then(|| subtype.to_string());
    Some(message)
}

fn normalize_result(raw: &Value) -> NormalizedMessage {
    let mut message = NormalizedMessage::new(
        MessageKind::Result,
        raw.get("result").cloned().unwrap_or(Value::Null),
    );
    message.subtype = str_field(raw, "subtype");
    message.is_error = raw.get("is_error").and_then(|v| v.as_bool());
    message
}

/// Latest task list written by a `TodoWrite` tool use in this line.
pub fn extract_todos(raw: &Value) -> Option<Vec<TaskItem>> {
    if raw.get("type").and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let blocks = raw.get("message")?.get("content")?.as_array()?;
    let block = blocks.iter().rev().find(|b| {
        b.get("type").and_then(|v| v.as_str()) == Some("tool_use")
            && b.get("name").and_then(|v| v.as_str()) == Some("TodoWrite")
    })?;
    let todos = block.get("input")?.get("todos")?.as_array()?;

    Some(
        todos
            .iter()
            .filter_map(|todo| {
                let content = todo.get("content").and_then(|v| v.as_str())?;
                let status = match todo.get("status").and_then(|v| v.as_str()) {
                    Some("in_progress") => TaskStatus::InProgress,
                    Some("completed") => TaskStatus::Completed,
                    _ => TaskStatus::Pending,
                };
                Some(TaskItem {
                    content: content.to_string(),
                    status,
                    active_form: str_field(todo, "activeForm"),
                })
            })
            .collect(),
    )
}

/// Context usage from a `result` line's `modelUsage` or flat `usage`.
pub fn extract_context_usage(raw: &Value) -> Option<ContextUsage> {
    if let Some(Value::Object(models)) = raw.get("modelUsage") {
        let mut total = ContextUsage {
            context_window: DEFAULT_CONTEXT_WINDOW,
            ..ContextUsage::default()
        };
        for stats in models.values() {
            total.input_tokens += u64_field(stats, "inputTokens");
            total.output_tokens += u64_field(stats, "outputTokens");
            total.cached_tokens += u64_field(stats, "cacheReadInputTokens");
            if let Some(cw) = stats.get("contextWindow").and_then(|v| v.as_u64()) {
                total.context_window = cw;
            }
        }
        if total.input_tokens > 0 || total.output_tokens > 0 {
            return Some(total);
        }
    }

    let usage = raw.get("usage")?;
    let input_tokens = u64_field(usage, "input_tokens");
    let output_tokens = u64_field(usage, "output_tokens");
    if input_tokens == 0 && output_tokens == 0 {
        return None;
    }
    Some(ContextUsage {
        input_tokens,
        output_tokens,
        cached_tokens: u64_field(usage, "cache_read_input_tokens"),
        context_window: DEFAULT_CONTEXT_WINDOW,
    })
}

fn join_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}
