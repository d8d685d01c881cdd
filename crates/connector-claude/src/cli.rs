//! Claude CLI driver
//!
//! Spawns the `claude` CLI for one invocation and speaks the NDJSON
//! stream-json protocol over stdin/stdout. Stdout lines are decoded into
//! run items and observer callbacks; permission prompts are forwarded to the
//! session's [`ToolApprover`] on their own task so stdout keeps draining.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use agentrelay_connector_core::{
    ApprovalDecision, ConnectorError, RunItem, RunObserver, RunOptions, RunStream, RunSummary,
    ToolApprovalRequest,
};
use agentrelay_protocol::{
    now_unix_z, PermissionMode, SubagentTask, SubagentToolCall, SUBAGENT_TOOLS,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::normalize::{extract_context_usage, normalize_value, str_field};

// ---------------------------------------------------------------------------
// Stdin messages (Rust → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

// ---------------------------------------------------------------------------
// Line decoding
// ---------------------------------------------------------------------------

/// What the driver should do with one stdout line
#[derive(Debug)]
pub(crate) enum LineAction {
    Emit(RunItem),
    /// The invocation failed; nothing follows.
    Fail(ConnectorError),
    Approve {
        request_id: String,
        request: ToolApprovalRequest,
    },
}

/// Per-invocation decoding state.
pub(crate) struct LineDecoder {
    observer: Arc<dyn RunObserver>,
    session_id: Option<String>,
    active_subagents: HashSet<String>,
}

impl LineDecoder {
    pub(crate) fn new(observer: Arc<dyn RunObserver>) -> Self {
        Self {
            observer,
            session_id: None,
            active_subagents: HashSet::new(),
        }
    }

    pub(crate) fn decode(&mut self, raw: &Value) -> Vec<LineAction> {
        let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match msg_type {
            "system" => self.on_system(raw),
            "assistant" => self.on_assistant(raw),
            "user" => self.on_user(raw),
            "stream_event" => {
                self.on_stream_event(raw);
                vec![]
            }
            "result" => self.on_result(raw),
            "control_request" => self.on_control_request(raw),
            "control_cancel_request" => {
                debug!(
                    component = "claude_connector",
                    event = "claude.control.cancelled",
                    request_id = ?str_field(raw, "request_id"),
                    "CLI cancelled control request"
                );
                vec![]
            }
            "keep_alive" | "auth_status" | "tool_progress" | "control_response" => vec![],
            _ => {
                debug!(
                    component = "claude_connector",
                    event = "claude.stdout.unknown_type",
                    msg_type = %msg_type,
                    "Unknown stdout message type"
                );
                vec![]
            }
        }
    }

    fn on_system(&mut self, raw: &Value) -> Vec<LineAction> {
        let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
        match subtype {
            "init" => {
                if let Some(sid) = str_field(raw, "session_id") {
                    info!(
                        component = "claude_connector",
                        event = "claude.init",
                        claude_session_id = %sid,
                        model = ?str_field(raw, "model"),
                        "Claude session initialized"
                    );
                    self.session_id = Some(sid);
                }
                if let Some(mode) = raw
                    .get("permissionMode")
                    .and_then(|v| v.as_str())
                    .and_then(PermissionMode::parse)
                {
                    self.observer.on_permission_mode_changed(mode);
                }
            }
            "status" => {
                if raw.get("status").and_then(|v| v.as_str()) == Some("compacting") {
                    self.observer.on_compacting(true);
                }
            }
            "compact_boundary" => self.observer.on_compacting(false),
            _ => {}
        }
        emit_normalized(raw)
    }

    fn on_assistant(&mut self, raw: &Value) -> Vec<LineAction> {
        let parent = str_field(raw, "parent_tool_use_id");
        let blocks = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for block in blocks {
            if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
                continue;
            }
            let Some(tool_name) = str_field(block, "name") else {
                continue;
            };
            let tool_use_id = str_field(block, "id");
            let input = block.get("input").cloned().unwrap_or(Value::Null);

            if let Some(parent_id) = parent.as_deref() {
                if self.active_subagents.contains(parent_id) {
                    self.observer.on_subagent_tool_call(
                        parent_id,
                        SubagentToolCall {
                            tool_name: tool_name.clone(),
                            tool_use_id: tool_use_id.clone(),
                            input: input.clone(),
                        },
                    );
                }
            }

            if SUBAGENT_TOOLS.contains(&tool_name.as_str()) {
                if let Some(id) = tool_use_id {
                    self.active_subagents.insert(id.clone());
                    self.observer.on_subagent_started(SubagentTask {
                        tool_use_id: id,
                        description: str_field(&input, "description").unwrap_or_default(),
                        subagent_type: str_field(&input, "subagent_type")
                            .unwrap_or_else(|| "general-purpose".to_string()),
                        tool_calls: Vec::new(),
                        started_at: now_unix_z(),
                    });
                }
            }
        }

        emit_normalized(raw)
    }

    fn on_user(&mut self, raw: &Value) -> Vec<LineAction> {
        if raw.get("isReplay").and_then(|v| v.as_bool()).unwrap_or(false) {
            return vec![];
        }

        let blocks = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();
        for block in blocks {
            if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
                continue;
            }
            if let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str()) {
                if self.active_subagents.remove(id) {
                    self.observer.on_subagent_completed(id);
                }
            }
        }

        emit_normalized(raw)
    }

    fn on_stream_event(&mut self, raw: &Value) {
        let Some(event) = raw.get("event") else {
            return;
        };
        if event.get("type").and_then(|v| v.as_str()) != Some("content_block_delta") {
            return;
        }
        let Some(delta) = event.get("delta") else {
            return;
        };
        if delta.get("type").and_then(|v| v.as_str()) == Some("thinking_delta") {
            if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                self.observer.on_thinking_delta(text);
            }
        }
    }

    fn on_result(&mut self, raw: &Value) -> Vec<LineAction> {
        if let Some(usage) = extract_context_usage(raw) {
            self.observer.on_context_usage(usage);
        }

        let mut actions = emit_normalized(raw);

        let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
        let is_error = raw.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false)
            || subtype.starts_with("error");
        if is_error {
            let reason = str_field(raw, "result")
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| {
                    if subtype.is_empty() {
                        "error".to_string()
                    } else {
                        subtype.to_string()
                    }
                });
            actions.push(LineAction::Fail(ConnectorError::ProviderError(reason)));
            return actions;
        }

        actions.push(LineAction::Emit(RunItem::Finished(RunSummary {
            provider_session_id: str_field(raw, "session_id").or_else(|| self.session_id.clone()),
            total_cost_usd: raw
                .get("total_cost_usd")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            num_turns: raw.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })));
        actions
    }

    fn on_control_request(&mut self, raw: &Value) -> Vec<LineAction> {
        let Some(request) = raw.get("request") else {
            return vec![];
        };
        let subtype = request.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
        if subtype != "can_use_tool" {
            debug!(
                component = "claude_connector",
                event = "claude.control_request.unhandled",
                subtype = %subtype,
                "Unhandled CLI control request subtype"
            );
            return vec![];
        }

        let request_id = str_field(raw, "request_id").unwrap_or_default();
        let tool_name = str_field(request, "tool_name").unwrap_or_else(|| "unknown".to_string());
        let tool_use_id = str_field(request, "tool_use_id").unwrap_or_else(|| request_id.clone());

        debug!(
            component = "claude_connector",
            event = "claude.approval_requested",
            request_id = %request_id,
            tool_name = %tool_name,
            tool_use_id = %tool_use_id,
            "CLI requesting tool approval"
        );

        vec![LineAction::Approve {
            request_id,
            request: ToolApprovalRequest {
                tool_name,
                tool_use_id,
                input: request.get("input").cloned().unwrap_or(Value::Null),
            },
        }]
    }
}

fn emit_normalized(raw: &Value) -> Vec<LineAction> {
    normalize_value(raw)
        .map(|message| vec![LineAction::Emit(RunItem::Message(message))])
        .unwrap_or_default()
}

/// The `control_response` body answering a `can_use_tool` request.
pub(crate) fn approval_response(request: &ToolApprovalRequest, decision: &ApprovalDecision) -> Value {
    match decision {
        ApprovalDecision::Allow { updated_input } => json!({
            "behavior": "allow",
            "updatedInput": updated_input.clone().unwrap_or_else(|| request.input.clone()),
            "toolUseID": request.tool_use_id,
        }),
        ApprovalDecision::Deny { message } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": false,
            "toolUseID": request.tool_use_id,
        }),
    }
}

// ---------------------------------------------------------------------------
// Process driver
// ---------------------------------------------------------------------------

type ItemSender = mpsc::Sender<Result<RunItem, ConnectorError>>;

/// Start an invocation; items arrive on the returned stream.
pub(crate) fn spawn_run(binary: Option<PathBuf>, options: RunOptions) -> RunStream {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        if let Err(err) = drive(binary, options, &tx).await {
            let _ = tx.send(Err(err)).await;
        }
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

fn cli_args(options: &RunOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
        "--permission-prompt-tool",
        "stdio",
        "--include-partial-messages",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(model) = &options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(resume) = &options.resume_session_id {
        args.extend(["--resume".to_string(), resume.clone()]);
    }
    args.extend([
        "--permission-mode".to_string(),
        options.permission_mode.as_str().to_string(),
    ]);
    args
}

async fn drive(
    binary: Option<PathBuf>,
    options: RunOptions,
    tx: &ItemSender,
) -> Result<(), ConnectorError> {
    let claude_bin = resolve_claude_binary(binary.as_deref()).await?;
    let args = cli_args(&options);

    info!(
        component = "claude_connector",
        event = "claude.spawn",
        cwd = %options.cwd.display(),
        claude_bin = %claude_bin.display(),
        resume_id = ?options.resume_session_id,
        "Spawning Claude CLI"
    );

    let mut child = tokio::process::Command::new(&claude_bin)
        .args(&args)
        .current_dir(&options.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("CLAUDE_CODE_ENTRYPOINT", "agentrelay")
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConnectorError::SpawnError(format!("Failed to spawn claude CLI: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ConnectorError::SpawnError("No stdin on child".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConnectorError::SpawnError("No stdout on child".into()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "claude_connector",
                    event = "claude.stderr",
                    line = %line,
                    "Claude CLI stderr"
                );
            }
        });
    }

    let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
    tokio::spawn(stdin_writer(stdin, stdin_rx));

    write_stdin(
        &stdin_tx,
        &StdinMessage::User {
            session_id: String::new(),
            message: UserMessagePayload {
                role: "user",
                content: vec![UserContentBlock::Text {
                    text: options.prompt.clone(),
                }],
            },
            parent_tool_use_id: None,
        },
    )
    .await?;

    let mut decoder = LineDecoder::new(options.observer.clone());
    let mut lines = BufReader::new(stdout).lines();

    let outcome = loop {
        let line = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => break Err(ConnectorError::Aborted),
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(
                    component = "claude_connector",
                    event = "claude.stdout.eof",
                    "Claude CLI stdout EOF before result"
                );
                break Err(ConnectorError::ProviderError(
                    "Claude CLI exited before producing a result".into(),
                ));
            }
            Err(e) => {
                error!(
                    component = "claude_connector",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                break Err(e.into());
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    component = "claude_connector",
                    event = "claude.stdout.parse_error",
                    error = %e,
                    line_preview = %line.chars().take(200).collect::<String>(),
                    "Failed to parse stdout JSON"
                );
                continue;
            }
        };

        let mut done = None;
        for action in decoder.decode(&raw) {
            match action {
                LineAction::Emit(item) => {
                    let finished = matches!(item, RunItem::Finished(_));
                    if tx.send(Ok(item)).await.is_err() {
                        done = Some(Ok(()));
                        break;
                    }
                    if finished {
                        done = Some(Ok(()));
                    }
                }
                LineAction::Fail(err) => {
                    done = Some(Err(err));
                    break;
                }
                LineAction::Approve {
                    request_id,
                    request,
                } => spawn_approval(&options, stdin_tx.clone(), request_id, request),
            }
        }
        if let Some(result) = done {
            break result;
        }
    };

    if let Err(e) = child.kill().await {
        debug!(
            component = "claude_connector",
            event = "claude.kill_failed",
            error = %e,
            "Failed to kill Claude CLI"
        );
    }
    outcome
}

fn spawn_approval(
    options: &RunOptions,
    stdin_tx: mpsc::Sender<String>,
    request_id: String,
    request: ToolApprovalRequest,
) {
    let approver = options.approver.clone();
    tokio::spawn(async move {
        let decision = approver.request_approval(request.clone()).await;
        let msg = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id,
                response: approval_response(&request, &decision),
            },
        };
        if let Err(e) = write_stdin(&stdin_tx, &msg).await {
            debug!(
                component = "claude_connector",
                event = "claude.approval.write_failed",
                tool_use_id = %request.tool_use_id,
                error = %e,
                "Could not deliver approval decision"
            );
        }
    });
}

async fn write_stdin(
    stdin_tx: &mpsc::Sender<String>,
    msg: &StdinMessage,
) -> Result<(), ConnectorError> {
    let json = serde_json::to_string(msg)?;
    stdin_tx
        .send(json)
        .await
        .map_err(|_| ConnectorError::ChannelClosed)
}

async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.flush_error",
                error = %e,
                "Failed to flush CLI stdin"
            );
            break;
        }
    }
}

/// Resolve the claude binary path.
/// 1. Configured path (`--claude-bin` / `CLAUDE_BIN`)
/// 2. ~/.claude/local/claude
/// 3. Search PATH via `which`
async fn resolve_claude_binary(configured: Option<&Path>) -> Result<PathBuf, ConnectorError> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.configured_not_found",
            path = %path.display(),
            "Configured claude binary does not exist, trying fallbacks"
        );
    }

    if let Some(home) = dirs::home_dir() {
        let local = home.join(".claude").join("local").join("claude");
        if local.exists() {
            return Ok(local);
        }
    }

    if let Ok(output) = tokio::process::Command::new("which")
        .arg("claude")
        .output()
        .await
    {
        if output.status.success() {
            let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
            if !path.as_os_str().is_empty() && path.exists() {
                return Ok(path);
            }
        }
    }

    Err(ConnectorError::SpawnError(
        "Claude CLI binary not found. Install Claude Code or set CLAUDE_BIN.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_connector_core::{NoopObserver, ToolApprover};
    use agentrelay_protocol::{ContextUsage, MessageKind};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RunObserver for Recorder {
        fn on_thinking_delta(&self, text: &str) {
            self.calls.lock().unwrap().push(format!("thinking:{text}"));
        }
        fn on_subagent_started(&self, task: SubagentTask) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("started:{}:{}", task.tool_use_id, task.description));
        }
        fn on_subagent_tool_call(&self, parent: &str, call: SubagentToolCall) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("call:{parent}:{}", call.tool_name));
        }
        fn on_subagent_completed(&self, id: &str) {
            self.calls.lock().unwrap().push(format!("completed:{id}"));
        }
        fn on_compacting(&self, is_compacting: bool) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("compacting:{is_compacting}"));
        }
        fn on_context_usage(&self, usage: ContextUsage) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("usage:{}", usage.input_tokens));
        }
        fn on_permission_mode_changed(&self, mode: PermissionMode) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("mode:{}", mode.as_str()));
        }
    }

    fn decoder() -> (LineDecoder, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (LineDecoder::new(recorder.clone()), recorder)
    }

    #[test]
    fn init_reports_mode_and_emits_command_listing() {
        let (mut decoder, recorder) = decoder();
        let actions = decoder.decode(&json!({
            "type": "system", "subtype": "init", "session_id": "sess-1",
            "permissionMode": "plan", "slash_commands": ["compact"]
        }));
        assert_eq!(recorder.calls(), vec!["mode:plan"]);
        assert_eq!(decoder.session_id.as_deref(), Some("sess-1"));
        match actions.as_slice() {
            [LineAction::Emit(RunItem::Message(msg))] => assert!(msg.is_command_listing()),
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn subagent_lifecycle_is_reported() {
        let (mut decoder, recorder) = decoder();
        decoder.decode(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "task-1", "name": "Task",
                "input": {"description": "explore", "subagent_type": "Explore"}}]}
        }));
        decoder.decode(&json!({
            "type": "assistant", "parent_tool_use_id": "task-1",
            "message": {"content": [{"type": "tool_use", "id": "inner", "name": "Grep", "input": {}}]}
        }));
        decoder.decode(&json!({
            "type": "assistant", "parent_tool_use_id": "unknown",
            "message": {"content": [{"type": "tool_use", "id": "x", "name": "Read", "input": {}}]}
        }));
        decoder.decode(&json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "task-1", "content": "done"}]}
        }));

        assert_eq!(
            recorder.calls(),
            vec!["started:task-1:explore", "call:task-1:Grep", "completed:task-1"]
        );
        assert!(decoder.active_subagents.is_empty());
    }

    #[test]
    fn thinking_deltas_and_compaction_reach_observer() {
        let (mut decoder, recorder) = decoder();
        let actions = decoder.decode(&json!({
            "type": "stream_event",
            "event": {"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "hmm"}}
        }));
        assert!(actions.is_empty());
        decoder.decode(&json!({"type": "system", "subtype": "status", "status": "compacting"}));
        decoder.decode(&json!({"type": "system", "subtype": "compact_boundary"}));
        assert_eq!(
            recorder.calls(),
            vec!["thinking:hmm", "compacting:true", "compacting:false"]
        );
    }

    #[test]
    fn successful_result_finishes_with_summary() {
        let (mut decoder, recorder) = decoder();
        decoder.decode(&json!({"type": "system", "subtype": "init", "session_id": "sess-9"}));
        let actions = decoder.decode(&json!({
            "type": "result", "subtype": "success", "is_error": false,
            "result": "ok", "total_cost_usd": 0.25, "num_turns": 3,
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }));
        assert_eq!(recorder.calls(), vec!["usage:12"]);
        match actions.as_slice() {
            [LineAction::Emit(RunItem::Message(msg)), LineAction::Emit(RunItem::Finished(summary))] => {
                assert_eq!(msg.kind, MessageKind::Result);
                assert_eq!(summary.provider_session_id.as_deref(), Some("sess-9"));
                assert_eq!(summary.num_turns, 3);
                assert!((summary.total_cost_usd - 0.25).abs() < f64::EPSILON);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn error_result_fails_the_run() {
        let (mut decoder, _) = decoder();
        let actions = decoder.decode(&json!({
            "type": "result", "subtype": "error_during_execution", "is_error": true
        }));
        match actions.last() {
            Some(LineAction::Fail(ConnectorError::ProviderError(reason))) => {
                assert_eq!(reason, "error_during_execution")
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn can_use_tool_becomes_approval_request() {
        let (mut decoder, _) = decoder();
        let actions = decoder.decode(&json!({
            "type": "control_request", "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash",
                "tool_use_id": "toolu_1", "input": {"command": "ls"}}
        }));
        match actions.as_slice() {
            [LineAction::Approve { request_id, request }] => {
                assert_eq!(request_id, "req-1");
                assert_eq!(request.tool_name, "Bash");
                assert_eq!(request.tool_use_id, "toolu_1");
                assert_eq!(request.input, json!({"command": "ls"}));
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn approval_response_payloads() {
        let request = ToolApprovalRequest {
            tool_name: "Bash".into(),
            tool_use_id: "toolu_1".into(),
            input: json!({"command": "ls"}),
        };
        let allow = approval_response(&request, &ApprovalDecision::allow());
        assert_eq!(allow["behavior"], "allow");
        assert_eq!(allow["updatedInput"], json!({"command": "ls"}));
        assert_eq!(allow["toolUseID"], "toolu_1");

        let edited = approval_response(
            &request,
            &ApprovalDecision::Allow {
                updated_input: Some(json!({"command": "ls -la"})),
            },
        );
        assert_eq!(edited["updatedInput"], json!({"command": "ls -la"}));

        let deny = approval_response(&request, &ApprovalDecision::deny("nope"));
        assert_eq!(deny["behavior"], "deny");
        assert_eq!(deny["message"], "nope");
    }

    struct AllowAll;

    #[async_trait]
    impl ToolApprover for AllowAll {
        async fn request_approval(&self, _request: ToolApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::allow()
        }
    }

    #[test]
    fn cli_args_carry_resume_model_and_mode() {
        let options = RunOptions {
            prompt: "hi".into(),
            cwd: PathBuf::from("/tmp"),
            permission_mode: PermissionMode::AcceptEdits,
            model: Some("opus".into()),
            resume_session_id: Some("sess-1".into()),
            cancel: CancellationToken::new(),
            approver: Arc::new(AllowAll),
            observer: Arc::new(NoopObserver),
        };
        let args = cli_args(&options);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--permission-prompt-tool stdio"));
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--permission-mode acceptEdits"));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_spawn_error_on_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let options = RunOptions {
            prompt: "hi".into(),
            cwd: tmp.path().to_path_buf(),
            permission_mode: PermissionMode::Default,
            model: None,
            resume_session_id: None,
            cancel: CancellationToken::new(),
            approver: Arc::new(AllowAll),
            observer: Arc::new(NoopObserver),
        };
        // A directory is not executable, so spawning fails regardless of PATH.
        let mut stream = spawn_run(Some(tmp.path().to_path_buf()), options);
        match stream.next().await {
            Some(Err(ConnectorError::SpawnError(_))) => {}
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
