//! Deterministic provider and helpers for router/runner tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentrelay_connector_core::{
    AgentProvider, ApprovalDecision, ConnectorError, HistoryPage, HistoryQuery, RunItem,
    RunOptions, RunStream, RunSummary, SessionListing, ToolApprovalRequest,
};
use agentrelay_protocol::{
    now_unix_z, ContextUsage, DiffFileStat, GitDiffSnapshot, MessageKind, NormalizedMessage,
    ServerMessage, SubagentTask, TaskItem,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::git::DiffSource;
use crate::registry::{Registry, RegistryConfig};
use crate::router::{RouterConfig, SessionRouter, Subscriber};
use crate::runner::SessionRunner;
use crate::state::AppState;

/// One scripted action of a fake invocation
pub(crate) enum Step {
    Message(NormalizedMessage),
    Approval {
        tool_name: String,
        tool_use_id: String,
        input: Value,
    },
    Thinking(String),
    Compacting(bool),
    Usage(ContextUsage),
    SubagentStarted(SubagentTask),
    /// Block until notified. Cancellation is not observed.
    Gate(Arc<Notify>),
    WaitForCancel,
    Fail(String),
    Finish(Option<String>),
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRun {
    pub prompt: String,
    pub resume_session_id: Option<String>,
}

/// Provider whose invocations replay queued scripts and whose logs are
/// `<dir>/<id>.jsonl` files of serialized [`NormalizedMessage`]s.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    dir: PathBuf,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    runs: Mutex<Vec<RecordedRun>>,
    decisions: Arc<Mutex<Vec<(String, ApprovalDecision)>>>,
    tasks: Mutex<HashMap<String, Vec<TaskItem>>>,
    history_gate: Mutex<Option<Arc<Notify>>>,
    history_reads: AtomicUsize,
    hide_missing_logs: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            ..Self::default()
        })
    }

    pub fn script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<(String, ApprovalDecision)> {
        self.decisions.lock().unwrap().clone()
    }

    pub fn set_tasks(&self, session_id: &str, tasks: Vec<TaskItem>) {
        self.tasks
            .lock()
            .unwrap()
            .insert(session_id.to_string(), tasks);
    }

    /// History reads wait for `gate` before touching the file.
    pub fn gate_history(&self, gate: Arc<Notify>) {
        *self.history_gate.lock().unwrap() = Some(gate);
    }

    /// Report no log path until the file exists, like a transcript that
    /// has not been written yet.
    pub fn hide_missing_logs(&self) {
        self.hide_missing_logs.store(true, Ordering::SeqCst);
    }

    pub fn history_reads(&self) -> usize {
        self.history_reads.load(Ordering::SeqCst)
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    pub fn append_message(&self, session_id: &str, message: &NormalizedMessage) {
        let line = serde_json::to_string(message).unwrap();
        self.append_raw(session_id, &format!("{line}\n"));
    }

    pub fn append_raw(&self, session_id: &str, text: &str) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(session_id))
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn run(&self, options: RunOptions) -> RunStream {
        self.runs.lock().unwrap().push(RecordedRun {
            prompt: options.prompt.clone(),
            resume_session_id: options.resume_session_id.clone(),
        });
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Finish(None)]);
        let decisions = self.decisions.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for step in steps {
                let item = match step {
                    Step::Message(message) => Ok(RunItem::Message(message)),
                    Step::Approval {
                        tool_name,
                        tool_use_id,
                        input,
                    } => {
                        let decision = options
                            .approver
                            .request_approval(ToolApprovalRequest {
                                tool_name,
                                tool_use_id: tool_use_id.clone(),
                                input,
                            })
                            .await;
                        decisions.lock().unwrap().push((tool_use_id, decision));
                        continue;
                    }
                    Step::Thinking(text) => {
                        options.observer.on_thinking_delta(&text);
                        continue;
                    }
                    Step::Compacting(flag) => {
                        options.observer.on_compacting(flag);
                        continue;
                    }
                    Step::Usage(usage) => {
                        options.observer.on_context_usage(usage);
                        continue;
                    }
                    Step::SubagentStarted(task) => {
                        options.observer.on_subagent_started(task);
                        continue;
                    }
                    Step::Gate(gate) => {
                        gate.notified().await;
                        continue;
                    }
                    Step::WaitForCancel => {
                        options.cancel.cancelled().await;
                        Err(ConnectorError::Aborted)
                    }
                    Step::Fail(message) => Err(ConnectorError::ProviderError(message)),
                    Step::Finish(provider_session_id) => Ok(RunItem::Finished(RunSummary {
                        provider_session_id,
                        total_cost_usd: 0.0,
                        num_turns: 1,
                    })),
                };
                let stop = item.is_err();
                if tx.send(item).is_err() || stop {
                    return;
                }
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn session_file_path(&self, session_id: &str) -> Option<PathBuf> {
        let path = self.log_path(session_id);
        if self.hide_missing_logs.load(Ordering::SeqCst) && !path.exists() {
            return None;
        }
        Some(path)
    }

    fn normalize_file_line(&self, line: &str, index: usize) -> Option<NormalizedMessage> {
        let mut message: NormalizedMessage = serde_json::from_str(line).ok()?;
        message.index = index;
        Some(message)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<HistoryPage, ConnectorError> {
        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.history_reads.fetch_add(1, Ordering::SeqCst);

        let bytes = match tokio::fs::read(self.log_path(session_id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConnectorError::NotFound(session_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
        let messages: Vec<NormalizedMessage> = String::from_utf8_lossy(&bytes[..complete])
            .lines()
            .filter_map(|line| serde_json::from_str::<NormalizedMessage>(line).ok())
            .enumerate()
            .map(|(index, mut message)| {
                message.index = index;
                message
            })
            .collect();
        let tasks = self
            .tasks
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(HistoryPage::paginate(
            messages,
            tasks,
            query,
            Some(complete as u64),
        ))
    }

    async fn list_sessions(
        &self,
        _cwd: Option<&Path>,
    ) -> Result<Vec<SessionListing>, ConnectorError> {
        let mut listings = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                listings.push(SessionListing {
                    id: id.to_string(),
                    path: path.clone(),
                    cwd: None,
                    modified_at: None,
                });
            }
        }
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listings)
    }
}

/// Diff source that counts calls and optionally blocks until released.
#[derive(Default)]
pub(crate) struct RecordingDiff {
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl RecordingDiff {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffSource for RecordingDiff {
    async fn diff(&self, _cwd: &Path) -> Option<GitDiffSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Some(GitDiffSnapshot {
            files: vec![DiffFileStat {
                path: "src/lib.rs".into(),
                additions: 3,
                deletions: 1,
            }],
            total_additions: 3,
            total_deletions: 1,
            computed_at: now_unix_z(),
        })
    }
}

pub(crate) fn user(text: &str) -> NormalizedMessage {
    NormalizedMessage::text(MessageKind::User, text)
}

pub(crate) fn assistant(text: &str) -> NormalizedMessage {
    NormalizedMessage::text(MessageKind::Assistant, text)
}

pub(crate) fn edit_tool_use(path: &str) -> NormalizedMessage {
    let mut message = NormalizedMessage::new(MessageKind::ToolUse, json!({ "file_path": path }));
    message.tool_name = Some("Edit".into());
    message.tool_use_id = Some(format!("toolu_{path}"));
    message
}

pub(crate) fn subagent(tool_use_id: &str) -> SubagentTask {
    SubagentTask {
        tool_use_id: tool_use_id.into(),
        description: "explore".into(),
        subagent_type: "general-purpose".into(),
        tool_calls: Vec::new(),
        started_at: now_unix_z(),
    }
}

pub(crate) fn usage() -> ContextUsage {
    ContextUsage {
        input_tokens: 1200,
        output_tokens: 300,
        cached_tokens: 800,
        context_window: 200_000,
    }
}

/// Everything currently queued for a subscriber.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Indices of the `message` frames, in delivery order.
pub(crate) fn message_indices(frames: &[ServerMessage]) -> Vec<usize> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerMessage::Message { message } => Some(message.index),
            _ => None,
        })
        .collect()
}

pub(crate) fn subscriber() -> (Subscriber, mpsc::UnboundedReceiver<ServerMessage>) {
    Subscriber::channel()
}

/// Poll `check` until it holds or a second passes.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Fully wired state over a scripted provider rooted at `dir`.
pub(crate) fn test_state(dir: &Path) -> (AppState, Arc<ScriptedProvider>) {
    let provider = ScriptedProvider::new(dir);
    let registry = Arc::new(Registry::new(RegistryConfig::default()));
    let router = Arc::new(SessionRouter::new(
        provider.clone(),
        RecordingDiff::new(),
        RouterConfig::default(),
    ));
    let runner = Arc::new(SessionRunner::new(
        registry.clone(),
        router.clone(),
        provider.clone(),
    ));
    let state = AppState {
        registry,
        router,
        runner,
        provider: provider.clone(),
        ping_interval: Duration::from_secs(30),
    };
    (state, provider)
}
