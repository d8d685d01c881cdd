//! Claude transcript files: `<projects>/<escaped-cwd>/<session-id>.jsonl`.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use agentrelay_connector_core::{ConnectorError, SessionListing};
use agentrelay_protocol::{NormalizedMessage, TaskItem};
use serde_json::Value;
use tracing::debug;

use crate::normalize::{extract_todos, normalize_value, str_field};

/// Parsed contents of a transcript
#[derive(Debug, Default)]
pub struct TranscriptHistory {
    pub messages: Vec<NormalizedMessage>,
    pub tasks: Vec<TaskItem>,
    /// Offset just past the last complete line.
    pub end_offset: u64,
}

/// Locates and reads transcripts under a Claude projects directory.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    projects_dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self { projects_dir }
    }

    /// `~/.claude/projects`
    pub fn default_projects_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".claude").join("projects"))
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Expected transcript path for a session started in `cwd`.
    pub fn path_for(&self, cwd: &Path, session_id: &str) -> Option<PathBuf> {
        let dir = escape_cwd(cwd)?;
        Some(
            self.projects_dir
                .join(dir)
                .join(format!("{session_id}.jsonl")),
        )
    }

    /// Find a session's transcript by scanning every project directory.
    pub async fn find(&self, session_id: &str) -> Option<PathBuf> {
        let file_name = format!("{session_id}.jsonl");
        let mut entries = tokio::fs::read_dir(&self.projects_dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let candidate = entry.path().join(&file_name);
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        None
    }

    /// Read and normalize a whole transcript. A trailing line without a
    /// newline is left for the tailer.
    pub async fn read_history(&self, path: &Path) -> Result<TranscriptHistory, ConnectorError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConnectorError::NotFound(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };

        let mut history = TranscriptHistory {
            end_offset: complete as u64,
            ..TranscriptHistory::default()
        };

        for line in bytes[..complete].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(raw) = serde_json::from_str::<Value>(line) else {
                debug!(
                    component = "claude_transcript",
                    event = "claude.transcript.parse_failed",
                    path = %path.display(),
                    "Skipping unparseable transcript line"
                );
                continue;
            };
            if let Some(todos) = extract_todos(&raw) {
                history.tasks = todos;
            }
            if let Some(mut message) = normalize_value(&raw) {
                message.index = history.messages.len();
                history.messages.push(message);
            }
        }

        Ok(history)
    }

    /// Sessions on disk, newest first. With `cwd`, only that project's directory.
    pub async fn list(&self, cwd: Option<&Path>) -> Result<Vec<SessionListing>, ConnectorError> {
        let dirs = match cwd {
            Some(cwd) => match escape_cwd(cwd) {
                Some(dir) => vec![self.projects_dir.join(dir)],
                None => Vec::new(),
            },
            None => {
                let mut dirs = Vec::new();
                let mut entries = match tokio::fs::read_dir(&self.projects_dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Vec::new())
                    }
                    Err(err) => return Err(err.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        dirs.push(entry.path());
                    }
                }
                dirs
            }
        };

        let mut listings = Vec::new();
        for dir in dirs {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };
                let modified = entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                let cwd = read_first_cwd(&path).await;
                listings.push((
                    modified.unwrap_or(0),
                    SessionListing {
                        id,
                        path,
                        cwd,
                        modified_at: modified.map(|secs| format!("{secs}Z")),
                    },
                ));
            }
        }

        listings.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(listings.into_iter().map(|(_, listing)| listing).collect())
    }
}

/// Claude's directory naming: every non-alphanumeric character becomes `-`.
fn escape_cwd(cwd: &Path) -> Option<String> {
    let raw = cwd.to_str()?;
    if raw.trim_start_matches('/').is_empty() {
        return None;
    }
    Some(
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect(),
    )
}

async fn read_first_cwd(path: &Path) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    // The cwd appears on the first real message; bookkeeping lines come first.
    for _ in 0..10 {
        let line = lines.next_line().await.ok()??;
        if let Ok(raw) = serde_json::from_str::<Value>(&line) {
            if let Some(cwd) = str_field(&raw, "cwd") {
                return Some(cwd);
            }
        }
    }
    None
}
