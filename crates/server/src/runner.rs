//! Session runner
//!
//! Drives one provider invocation per prompt: forwards messages and
//! transient events to the router, brokers tool approvals through the
//! registry, follows provider-assigned ids, and settles the final status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use agentrelay_connector_core::{
    AgentProvider, ApprovalDecision, ConnectorError, RunItem, RunObserver, RunOptions,
    ToolApprovalRequest, ToolApprover,
};
use agentrelay_protocol::{
    new_id, ContextUsage, PermissionMode, ServerMessage, SessionStatus, SessionSummary,
    SubagentTask, SubagentToolCall,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::registry::{ActiveSession, PendingApproval, Registry};
use crate::router::{DeliveryMode, SessionRouter};

const DEFAULT_DENY_MESSAGE: &str = "User denied this operation";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub cwd: PathBuf,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Resume an existing provider session under its own id.
    #[serde(default)]
    pub resume_session_id: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub model: Option<String>,
}

pub struct SessionRunner {
    registry: Arc<Registry>,
    router: Arc<SessionRouter>,
    provider: Arc<dyn AgentProvider>,
}

impl SessionRunner {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<SessionRouter>,
        provider: Arc<dyn AgentProvider>,
    ) -> Self {
        Self {
            registry,
            router,
            provider,
        }
    }

    /// Register a session and, when a prompt is given, start running it.
    pub fn create(self: &Arc<Self>, request: CreateSessionRequest) -> Result<SessionSummary, SessionError> {
        let id = request.resume_session_id.clone().unwrap_or_else(new_id);
        let prompt = request.prompt.filter(|p| !p.trim().is_empty());

        let mut session = ActiveSession::new(id.clone(), self.provider.name(), request.cwd);
        session.permission_mode = request.permission_mode.unwrap_or_default();
        session.model = request.model;
        session.resume_session_id = request.resume_session_id;
        if prompt.is_some() {
            session.status = SessionStatus::Starting;
            session.invocation_active = true;
        }
        let summary = session.summary();
        let cancel = session.cancel.clone();
        self.registry.insert(session)?;

        if let Some(prompt) = prompt {
            self.spawn_run(id, prompt, cancel);
        }
        Ok(summary)
    }

    /// Start a follow-up invocation with a fresh abort handle. Rejected as
    /// busy until the previous run, interrupted or not, has settled.
    pub fn send_prompt(self: &Arc<Self>, id: &str, text: String) -> Result<(), SessionError> {
        let (session_id, cancel) = self
            .registry
            .with_session_mut(id, |session| {
                if !session.accepts_prompt() {
                    return Err(SessionError::Busy(session.id.clone()));
                }
                session.invocation_active = true;
                session.status = SessionStatus::Starting;
                session.cancel = CancellationToken::new();
                session.last_error = None;
                session.finished_at = None;
                Ok((session.id.clone(), session.cancel.clone()))
            })
            .ok_or_else(|| SessionError::NotFound(id.to_string()))??;

        self.spawn_run(session_id, text, cancel);
        Ok(())
    }

    pub fn approve(
        &self,
        id: &str,
        tool_use_id: &str,
        always_allow: bool,
        answers: Option<Value>,
        updated_input: Option<Value>,
    ) -> Result<(), SessionError> {
        let pending = self
            .registry
            .take_pending_approval(id, tool_use_id, always_allow)?;

        let updated_input = match answers {
            Some(answers) => {
                let mut input = updated_input.unwrap_or(pending.input);
                if let Value::Object(map) = &mut input {
                    map.insert("answers".to_string(), answers);
                }
                Some(input)
            }
            None => updated_input,
        };

        info!(
            component = "runner",
            event = "runner.approval.allowed",
            session_id = %id,
            tool_use_id = %tool_use_id,
            tool_name = %pending.tool_name,
            always_allow,
            "Tool approved"
        );
        if pending
            .resolver
            .send(ApprovalDecision::Allow { updated_input })
            .is_err()
        {
            debug!(
                component = "runner",
                event = "runner.approval.orphaned",
                session_id = %id,
                tool_use_id = %tool_use_id,
                "Approval arrived after the request was abandoned"
            );
        }
        Ok(())
    }

    pub fn deny(&self, id: &str, tool_use_id: &str, message: Option<String>) -> Result<(), SessionError> {
        let pending = self.registry.take_pending_approval(id, tool_use_id, false)?;
        let message = message.unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string());

        info!(
            component = "runner",
            event = "runner.approval.denied",
            session_id = %id,
            tool_use_id = %tool_use_id,
            tool_name = %pending.tool_name,
            "Tool denied"
        );
        let _ = pending.resolver.send(ApprovalDecision::Deny { message });
        Ok(())
    }

    pub fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        self.registry.interrupt(id)?;
        info!(
            component = "runner",
            event = "runner.session.interrupted",
            session_id = %id,
            "Interrupt requested"
        );
        Ok(())
    }

    /// Interrupt and forget a session. Its router history stays for replay.
    pub fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.registry.interrupt(id)?;
        self.registry
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Takes effect on the next invocation.
    pub fn set_permission_mode(&self, id: &str, mode: PermissionMode) -> Result<(), SessionError> {
        let session_id = self
            .registry
            .with_session_mut(id, |session| {
                session.permission_mode = mode;
                session.id.clone()
            })
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        self.router
            .push_event(&session_id, ServerMessage::PermissionMode { mode });
        Ok(())
    }

    fn spawn_run(self: &Arc<Self>, session_id: String, prompt: String, cancel: CancellationToken) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.drive(session_id, prompt, cancel).await;
        });
    }

    async fn drive(&self, session_id: String, prompt: String, cancel: CancellationToken) {
        let started = self.registry.with_session_mut(&session_id, |session| {
            if !cancel.is_cancelled() {
                session.status = SessionStatus::Running;
            }
            (
                session.cwd.clone(),
                session.permission_mode,
                session.model.clone(),
                session.resume_session_id.clone(),
            )
        });
        let Some((cwd, permission_mode, model, resume_session_id)) = started else {
            warn!(
                component = "runner",
                event = "runner.run.orphaned",
                session_id = %session_id,
                "Session removed before its run started"
            );
            return;
        };

        self.router.set_mode(&session_id, DeliveryMode::Push);
        self.router.set_cwd(&session_id, cwd.clone());

        let current_id = Arc::new(ArcSwap::from_pointee(session_id.clone()));
        let outcome = if cancel.is_cancelled() {
            Ok(())
        } else {
            self.router
                .push_event(&session_id, ServerMessage::status(SessionStatus::Running, None));
            info!(
                component = "runner",
                event = "runner.run.started",
                session_id = %session_id,
                provider = self.provider.name(),
                resume = resume_session_id.is_some(),
                "Invocation started"
            );

            let options = RunOptions {
                prompt,
                cwd,
                permission_mode,
                model,
                resume_session_id,
                cancel: cancel.clone(),
                approver: Arc::new(ApprovalBroker {
                    registry: self.registry.clone(),
                    router: self.router.clone(),
                    current_id: current_id.clone(),
                    cancel: cancel.clone(),
                    turn: tokio::sync::Mutex::new(()),
                }),
                observer: Arc::new(RouterObserver {
                    registry: self.registry.clone(),
                    router: self.router.clone(),
                    current_id: current_id.clone(),
                }),
            };
            self.consume(options, &current_id).await
        };

        self.finalize(&current_id.load_full(), &cancel, outcome).await;
    }

    async fn consume(&self, options: RunOptions, current_id: &ArcSwap<String>) -> Result<(), ConnectorError> {
        let mut stream = self.provider.run(options);
        while let Some(item) = stream.next().await {
            match item? {
                RunItem::Message(message) => {
                    let session_id = current_id.load_full();
                    if message.is_command_listing() {
                        self.router.push_event(
                            &session_id,
                            ServerMessage::AvailableCommands {
                                commands: message.commands(),
                            },
                        );
                        continue;
                    }
                    self.router.push_message(&session_id, message);
                }
                RunItem::Finished(summary) => {
                    let session_id = current_id.load_full();
                    info!(
                        component = "runner",
                        event = "runner.run.result",
                        session_id = %session_id,
                        total_cost_usd = summary.total_cost_usd,
                        num_turns = summary.num_turns,
                        "Invocation reported result"
                    );
                    match summary.provider_session_id {
                        Some(new_id) if new_id != *session_id => self.follow_remap(current_id, new_id),
                        Some(same) => {
                            self.registry.with_session_mut(&same, |session| {
                                session.resume_session_id = Some(same.clone());
                            });
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// The provider assigned its own id: move registry and router state to it.
    fn follow_remap(&self, current_id: &ArcSwap<String>, new_id: String) {
        let old_id = current_id.load_full();
        if !self.registry.relocate(&old_id, &new_id) {
            warn!(
                component = "runner",
                event = "runner.remap.missing",
                old_session_id = %old_id,
                session_id = %new_id,
                "Session left the registry before remap"
            );
        }
        self.router.remap(&old_id, &new_id);
        current_id.store(Arc::new(new_id.clone()));
        self.router.push_event(
            &new_id,
            ServerMessage::SessionRedirected {
                new_session_id: new_id.clone(),
            },
        );
    }

    async fn finalize(&self, session_id: &str, cancel: &CancellationToken, outcome: Result<(), ConnectorError>) {
        let aborted = cancel.is_cancelled();
        let settle = |interrupted: bool| {
            if aborted || interrupted {
                (SessionStatus::Interrupted, None)
            } else if let Err(err) = &outcome {
                (SessionStatus::Error, Some(err.to_string()))
            } else {
                (SessionStatus::Completed, None)
            }
        };

        let (status, error_message) = self
            .registry
            .with_session_mut(session_id, |session| {
                let (status, error_message) = settle(session.status == SessionStatus::Interrupted);
                session.status = status;
                session.finished_at = Some(Instant::now());
                session.pending_approval = None;
                if error_message.is_some() {
                    session.last_error = error_message.clone();
                }
                (status, error_message)
            })
            .unwrap_or_else(|| settle(false));

        match &error_message {
            Some(message) => error!(
                component = "runner",
                event = "runner.run.failed",
                session_id = %session_id,
                error = %message,
                "Invocation failed"
            ),
            None => info!(
                component = "runner",
                event = "runner.run.finished",
                session_id = %session_id,
                status = ?status,
                "Invocation finished"
            ),
        }

        self.router
            .push_event(session_id, ServerMessage::status(status, error_message));
        self.router.transition_to_poll(session_id).await;

        self.registry.with_session_mut(session_id, |session| {
            session.invocation_active = false;
        });
    }
}

/// Bridges provider approval requests to the registry's pending slot.
///
/// The provider may ask about several tools at once. Requests take turns:
/// only one occupies the slot, and the rest wait until it is answered.
struct ApprovalBroker {
    registry: Arc<Registry>,
    router: Arc<SessionRouter>,
    current_id: Arc<ArcSwap<String>>,
    cancel: CancellationToken,
    turn: tokio::sync::Mutex<()>,
}

enum Admission {
    AutoAllowed,
    Pending(oneshot::Receiver<ApprovalDecision>),
}

#[async_trait]
impl ToolApprover for ApprovalBroker {
    async fn request_approval(&self, request: ToolApprovalRequest) -> ApprovalDecision {
        let _turn = tokio::select! {
            turn = self.turn.lock() => turn,
            _ = self.cancel.cancelled() => return ApprovalDecision::deny("Session interrupted"),
        };

        let session_id = self.current_id.load_full();
        let admission = self.registry.with_session_mut(&session_id, |session| {
            if session.always_allowed.contains(&request.tool_name) {
                return Admission::AutoAllowed;
            }
            let (resolver, decision) = oneshot::channel();
            session.pending_approval = Some(PendingApproval {
                tool_name: request.tool_name.clone(),
                tool_use_id: request.tool_use_id.clone(),
                input: request.input.clone(),
                resolver,
            });
            session.status = SessionStatus::WaitingForApproval;
            Admission::Pending(decision)
        });

        let decision = match admission {
            None => return ApprovalDecision::deny("Session no longer exists"),
            Some(Admission::AutoAllowed) => {
                debug!(
                    component = "runner",
                    event = "runner.approval.auto",
                    session_id = %session_id,
                    tool_name = %request.tool_name,
                    "Tool auto-approved"
                );
                return ApprovalDecision::allow();
            }
            Some(Admission::Pending(decision)) => decision,
        };

        self.router.push_event(
            &session_id,
            ServerMessage::status(SessionStatus::WaitingForApproval, None),
        );
        self.router.push_event(
            &session_id,
            ServerMessage::ToolApprovalRequest {
                tool_name: request.tool_name.clone(),
                tool_use_id: request.tool_use_id.clone(),
                input: request.input.clone(),
            },
        );

        tokio::select! {
            decision = decision => {
                let decision = decision
                    .unwrap_or_else(|_| ApprovalDecision::deny("Approval request was dropped"));
                self.resume_running();
                decision
            }
            _ = self.cancel.cancelled() => {
                self.registry.with_session_mut(&self.current_id.load_full(), |session| {
                    if session
                        .pending_approval
                        .as_ref()
                        .is_some_and(|p| p.tool_use_id == request.tool_use_id)
                    {
                        session.pending_approval = None;
                    }
                });
                ApprovalDecision::deny("Session interrupted")
            }
        }
    }
}

impl ApprovalBroker {
    fn resume_running(&self) {
        let session_id = self.current_id.load_full();
        let resumed = self
            .registry
            .with_session_mut(&session_id, |session| {
                let waiting = session.status == SessionStatus::WaitingForApproval
                    && session.pending_approval.is_none();
                if waiting {
                    session.status = SessionStatus::Running;
                }
                waiting
            })
            .unwrap_or(false);
        if resumed {
            self.router
                .push_event(&session_id, ServerMessage::status(SessionStatus::Running, None));
        }
    }
}

/// Forwards provider side-channel callbacks as router events.
struct RouterObserver {
    registry: Arc<Registry>,
    router: Arc<SessionRouter>,
    current_id: Arc<ArcSwap<String>>,
}

impl RouterObserver {
    fn emit(&self, event: ServerMessage) {
        self.router.push_event(&self.current_id.load_full(), event);
    }
}

impl RunObserver for RouterObserver {
    fn on_thinking_delta(&self, text: &str) {
        self.emit(ServerMessage::ThinkingDelta {
            text: text.to_string(),
        });
    }

    fn on_subagent_started(&self, task: SubagentTask) {
        self.emit(ServerMessage::SubagentStarted {
            tool_use_id: task.tool_use_id,
            description: task.description,
            subagent_type: task.subagent_type,
            started_at: task.started_at,
        });
    }

    fn on_subagent_tool_call(&self, parent_tool_use_id: &str, call: SubagentToolCall) {
        self.emit(ServerMessage::SubagentToolCall {
            parent_tool_use_id: parent_tool_use_id.to_string(),
            call,
        });
    }

    fn on_subagent_completed(&self, tool_use_id: &str) {
        self.emit(ServerMessage::SubagentCompleted {
            tool_use_id: tool_use_id.to_string(),
        });
    }

    fn on_compacting(&self, is_compacting: bool) {
        self.emit(ServerMessage::Compacting { is_compacting });
    }

    fn on_context_usage(&self, usage: ContextUsage) {
        self.emit(ServerMessage::ContextUsage { usage });
    }

    fn on_permission_mode_changed(&self, mode: PermissionMode) {
        self.registry
            .with_session_mut(&self.current_id.load_full(), |session| {
                session.permission_mode = mode;
            });
        self.emit(ServerMessage::PermissionMode { mode });
    }
}
