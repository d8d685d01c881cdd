//! Claude CLI connector
//!
//! Runs invocations through the `claude` CLI (stream-json over stdio) and
//! reads the CLI's JSONL transcripts for history, listing and tailing.

mod cli;
pub mod normalize;
pub mod transcript;

use std::path::{Path, PathBuf};

use agentrelay_connector_core::{
    AgentProvider, ConnectorError, HistoryPage, HistoryQuery, RunOptions, RunStream,
    SessionListing,
};
use agentrelay_protocol::NormalizedMessage;
use async_trait::async_trait;

pub use transcript::TranscriptStore;

/// [`AgentProvider`] backed by the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    transcripts: TranscriptStore,
    claude_bin: Option<PathBuf>,
}

impl ClaudeProvider {
    pub fn new(projects_dir: PathBuf, claude_bin: Option<PathBuf>) -> Self {
        Self {
            transcripts: TranscriptStore::new(projects_dir),
            claude_bin,
        }
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn run(&self, options: RunOptions) -> RunStream {
        cli::spawn_run(self.claude_bin.clone(), options)
    }

    async fn session_file_path(&self, session_id: &str) -> Option<PathBuf> {
        self.transcripts.find(session_id).await
    }

    fn normalize_file_line(&self, line: &str, index: usize) -> Option<NormalizedMessage> {
        let mut message = normalize::normalize_line(line)?;
        message.index = index;
        Some(message)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        query: HistoryQuery,
    ) -> Result<HistoryPage, ConnectorError> {
        let path = self
            .session_file_path(session_id)
            .await
            .ok_or_else(|| ConnectorError::NotFound(session_id.to_string()))?;
        let history = self.transcripts.read_history(&path).await?;
        Ok(HistoryPage::paginate(
            history.messages,
            history.tasks,
            query,
            Some(history.end_offset),
        ))
    }

    async fn list_sessions(&self, cwd: Option<&Path>) -> Result<Vec<SessionListing>, ConnectorError> {
        self.transcripts.list(cwd).await
    }
}
