//! Working-tree diff snapshots for sessions that edit files.

use std::path::Path;
use std::process::Stdio;

use agentrelay_protocol::{now_unix_z, DiffFileStat, GitDiffSnapshot};
use async_trait::async_trait;
use tokio::process::Command;

/// Computes a repository diff snapshot for a working directory.
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn diff(&self, cwd: &Path) -> Option<GitDiffSnapshot>;
}

/// `git diff --numstat HEAD` in the session's working directory.
pub struct GitDiffSource;

#[async_trait]
impl DiffSource for GitDiffSource {
    async fn diff(&self, cwd: &Path) -> Option<GitDiffSnapshot> {
        let numstat = run_git(&["diff", "--numstat", "HEAD"], cwd).await?;
        Some(parse_numstat(&numstat))
    }
}

async fn run_git(args: &[&str], cwd: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8(output.stdout).ok()
}

/// Binary files report `-` for both counts and are counted as zero.
fn parse_numstat(text: &str) -> GitDiffSnapshot {
    let files: Vec<DiffFileStat> = text
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next()?;
            let deletions = parts.next()?;
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(DiffFileStat {
                path: path.to_string(),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
            })
        })
        .collect();

    GitDiffSnapshot {
        total_additions: files.iter().map(|f| f.additions).sum(),
        total_deletions: files.iter().map(|f| f.deletions).sum(),
        files,
        computed_at: now_unix_z(),
    }
}
