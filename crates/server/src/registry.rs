//! Session registry
//!
//! Authoritative map of live, API-driven sessions plus the alias table that
//! keeps pre-remap ids resolvable.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use agentrelay_connector_core::ApprovalDecision;
use agentrelay_protocol::{now_unix_z, PermissionMode, SessionStatus, SessionSummary};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::router::SessionRouter;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    /// How long a terminal session stays before the sweep evicts it.
    pub session_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            session_ttl: Duration::from_secs(3600),
        }
    }
}

/// A tool-use waiting on a human decision
pub struct PendingApproval {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
    pub resolver: oneshot::Sender<ApprovalDecision>,
}

/// A live session
pub struct ActiveSession {
    pub id: String,
    pub provider: String,
    pub cwd: PathBuf,
    pub created_at: String,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    /// Provider-side id to continue on the next invocation.
    pub resume_session_id: Option<String>,
    pub cancel: CancellationToken,
    pub pending_approval: Option<PendingApproval>,
    pub always_allowed: HashSet<String>,
    pub status: SessionStatus,
    pub last_error: Option<String>,
    pub finished_at: Option<Instant>,
    /// Set from the moment a prompt is accepted until its run has settled.
    /// An interrupted run is no longer busy but may still be unwinding.
    pub invocation_active: bool,
}

impl ActiveSession {
    pub fn new(id: String, provider: &str, cwd: PathBuf) -> Self {
        Self {
            id,
            provider: provider.to_string(),
            cwd,
            created_at: now_unix_z(),
            permission_mode: PermissionMode::default(),
            model: None,
            resume_session_id: None,
            cancel: CancellationToken::new(),
            pending_approval: None,
            always_allowed: HashSet::new(),
            status: SessionStatus::Idle,
            last_error: None,
            finished_at: None,
            invocation_active: false,
        }
    }

    pub fn accepts_prompt(&self) -> bool {
        !self.status.is_busy() && !self.invocation_active
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            provider: self.provider.clone(),
            cwd: self.cwd.display().to_string(),
            status: self.status,
            permission_mode: self.permission_mode,
            model: self.model.clone(),
            created_at: self.created_at.clone(),
            has_pending_approval: self.pending_approval.is_some(),
            last_error: self.last_error.clone(),
        }
    }
}

pub struct Registry {
    config: RegistryConfig,
    sessions: DashMap<String, ActiveSession>,
    /// Prior id → current id.
    aliases: DashMap<String, String>,
    /// Serializes the capacity check with the insert.
    create_lock: Mutex<()>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            aliases: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Track a new session. Re-registering an existing id (resume) replaces the
    /// entry unless it is mid-invocation.
    pub fn insert(&self, session: ActiveSession) -> Result<(), SessionError> {
        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.sessions.get(&session.id) {
            if !existing.accepts_prompt() {
                return Err(SessionError::Busy(session.id.clone()));
            }
        } else if self.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::Capacity {
                max: self.config.max_sessions,
            });
        }

        info!(
            component = "registry",
            event = "registry.session.created",
            session_id = %session.id,
            status = ?session.status,
            "Session registered"
        );
        self.aliases.remove(&session.id);
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Current id for `id`, following the alias table.
    pub fn resolve(&self, id: &str) -> Option<String> {
        if self.sessions.contains_key(id) {
            return Some(id.to_string());
        }
        let target = self.aliases.get(id)?.value().clone();
        self.sessions.contains_key(&target).then_some(target)
    }

    pub fn with_session<R>(&self, id: &str, f: impl FnOnce(&ActiveSession) -> R) -> Option<R> {
        let id = self.resolve(id)?;
        let session = self.sessions.get(&id)?;
        Some(f(&session))
    }

    pub fn with_session_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ActiveSession) -> R,
    ) -> Option<R> {
        let id = self.resolve(id)?;
        let mut session = self.sessions.get_mut(&id)?;
        Some(f(&mut session))
    }

    pub fn summary(&self, id: &str) -> Option<SessionSummary> {
        self.with_session(id, ActiveSession::summary)
    }

    /// Live sessions, oldest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions.iter().map(|entry| entry.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Move a session to the id its provider assigned, leaving an alias behind.
    pub fn relocate(&self, old_id: &str, new_id: &str) -> bool {
        let Some((_, mut session)) = self.sessions.remove(old_id) else {
            return false;
        };
        session.id = new_id.to_string();
        session.resume_session_id = Some(new_id.to_string());
        self.sessions.insert(new_id.to_string(), session);
        self.aliases.remove(new_id);

        for mut alias in self.aliases.iter_mut() {
            if alias.value() == old_id {
                *alias.value_mut() = new_id.to_string();
            }
        }
        self.aliases.insert(old_id.to_string(), new_id.to_string());

        info!(
            component = "registry",
            event = "registry.session.relocated",
            old_session_id = %old_id,
            session_id = %new_id,
            "Session relocated to provider id"
        );
        true
    }

    /// Mark a running session interrupted and signal its abort handle. Idempotent.
    pub fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        self.with_session_mut(id, |session| {
            if session.status.is_busy() {
                session.status = SessionStatus::Interrupted;
            }
            session.cancel.cancel();
        })
        .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Remove the entry and every alias pointing at it.
    pub fn remove(&self, id: &str) -> Option<ActiveSession> {
        let id = self.resolve(id)?;
        let (_, session) = self.sessions.remove(&id)?;
        self.aliases.retain(|_, target| *target != id);
        info!(
            component = "registry",
            event = "registry.session.removed",
            session_id = %id,
            "Session removed"
        );
        Some(session)
    }

    /// Take the pending approval if it matches `tool_use_id`. The slot is
    /// empty before the caller resolves it.
    pub fn take_pending_approval(
        &self,
        id: &str,
        tool_use_id: &str,
        always_allow: bool,
    ) -> Result<PendingApproval, SessionError> {
        self.with_session_mut(id, |session| {
            let matches = session
                .pending_approval
                .as_ref()
                .is_some_and(|p| p.tool_use_id == tool_use_id);
            if !matches {
                return Err(SessionError::NoPendingApproval);
            }
            let pending = session
                .pending_approval
                .take()
                .ok_or(SessionError::NoPendingApproval)?;
            if always_allow {
                session.always_allowed.insert(pending.tool_name.clone());
            }
            Ok(pending)
        })
        .ok_or_else(|| SessionError::NotFound(id.to_string()))?
    }

    /// Evict terminal sessions past their TTL and prune dangling aliases.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let ttl = self.config.session_ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && !entry.invocation_active
                    && entry
                        .finished_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.sessions.remove(id);
        }
        self.aliases
            .retain(|_, target| self.sessions.contains_key(target.as_str()));

        if !expired.is_empty() {
            info!(
                component = "registry",
                event = "registry.sweep.evicted",
                count = expired.len(),
                "Evicted expired sessions"
            );
        }
        expired
    }

    /// Periodically sweep, parking the router state of evicted sessions.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, router: Arc<SessionRouter>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.sweep(Instant::now());
                for id in &evicted {
                    router.park(id);
                }
                debug!(
                    component = "registry",
                    event = "registry.sweep.tick",
                    evicted = evicted.len(),
                    live = self.len(),
                    "Registry sweep"
                );
            }
        })
    }
}
