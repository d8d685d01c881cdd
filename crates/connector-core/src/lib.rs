//! agentrelay connector core
//!
//! The contract every agent provider implements. The session runner and
//! router depend only on these types, never on a concrete connector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentrelay_protocol::{
    ContextUsage, NormalizedMessage, PermissionMode, SubagentTask, SubagentToolCall, TaskItem,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invocation aborted")]
    Aborted,

    #[error("Provider error: {0}")]
    ProviderError(String),
}

impl ConnectorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::NotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Tool approval
// ---------------------------------------------------------------------------

/// A provider asking whether a tool may run
#[derive(Debug, Clone)]
pub struct ToolApprovalRequest {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
}

/// Answer to a [`ToolApprovalRequest`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Allow { updated_input: Option<Value> },
    Deny { message: String },
}

impl ApprovalDecision {
    pub fn allow() -> Self {
        ApprovalDecision::Allow {
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        ApprovalDecision::Deny {
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, ApprovalDecision::Allow { .. })
    }
}

/// Brokers tool approvals for a running invocation.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn request_approval(&self, request: ToolApprovalRequest) -> ApprovalDecision;
}

/// Optional streaming callbacks. Every method is a no-op unless overridden.
pub trait RunObserver: Send + Sync {
    fn on_thinking_delta(&self, _text: &str) {}
    fn on_subagent_started(&self, _task: SubagentTask) {}
    fn on_subagent_tool_call(&self, _parent_tool_use_id: &str, _call: SubagentToolCall) {}
    fn on_subagent_completed(&self, _tool_use_id: &str) {}
    fn on_compacting(&self, _is_compacting: bool) {}
    fn on_context_usage(&self, _usage: ContextUsage) {}
    fn on_permission_mode_changed(&self, _mode: PermissionMode) {}
}

/// Observer that ignores every callback.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything a provider needs to run one invocation
#[derive(Clone)]
pub struct RunOptions {
    pub prompt: String,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    /// Provider session to continue, if any.
    pub resume_session_id: Option<String>,
    pub cancel: CancellationToken,
    pub approver: Arc<dyn ToolApprover>,
    pub observer: Arc<dyn RunObserver>,
}

/// Terminal report of an invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Identity the provider assigned to the session.
    pub provider_session_id: Option<String>,
    pub total_cost_usd: f64,
    pub num_turns: u32,
}

/// One item of an invocation's output sequence
#[derive(Debug, Clone)]
pub enum RunItem {
    Message(NormalizedMessage),
    Finished(RunSummary),
}

pub type RunStream = BoxStream<'static, Result<RunItem, ConnectorError>>;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Page selector for history reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Exclusive upper bound on message index.
    pub before: Option<usize>,
    /// Keep at most this many of the most recent messages below `before`.
    pub limit: Option<usize>,
}

/// One page of a session's on-disk history
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<NormalizedMessage>,
    pub tasks: Vec<TaskItem>,
    pub total_messages: usize,
    pub has_more: bool,
    pub oldest_index: usize,
    /// Byte offset of the log through which this page was read.
    pub end_offset: Option<u64>,
}

impl HistoryPage {
    /// Build a page from a full, index-ordered history.
    pub fn paginate(
        mut all: Vec<NormalizedMessage>,
        tasks: Vec<TaskItem>,
        query: HistoryQuery,
        end_offset: Option<u64>,
    ) -> Self {
        let total_messages = all.len();
        let end = query.before.unwrap_or(total_messages).min(total_messages);
        let start = match query.limit {
            Some(limit) => end.saturating_sub(limit),
            None => 0,
        };
        all.truncate(end);
        let messages = all.split_off(start);
        Self {
            messages,
            tasks,
            total_messages,
            has_more: start > 0,
            oldest_index: start,
            end_offset,
        }
    }
}

/// A session discovered on disk
#[derive(Debug, Clone, PartialEq)]
pub struct SessionListing {
    pub id: String,
    pub path: PathBuf,
    pub cwd: Option<String>,
    pub modified_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// An agent provider: runs invocations and exposes its on-disk session logs.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start an invocation. The stream ends after a `RunItem::Finished`
    /// or the first error.
    fn run(&self, options: RunOptions) -> RunStream;

    /// Resolve a session id to its append-only log file.
    async fn session_file_path(&self, session_id: &str) -> Option<PathBuf>;

    /// Parse one complete log line.
    fn normalize_file_line(&self, line: &str, index: usize) -> Option<NormalizedMessage>;

    /// Paginated history read. Fails with [`ConnectorError::NotFound`] for unknown sessions.
    async fn get_messages(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<HistoryPage, ConnectorError>;

    async fn list_sessions(&self, cwd: Option<&Path>) -> Result<Vec<SessionListing>, ConnectorError>;
}
