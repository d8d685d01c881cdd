//! Per-session router state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use agentrelay_protocol::{
    ContextUsage, GitDiffSnapshot, NormalizedMessage, PermissionMode, ServerMessage,
    SubagentTask, SubagentToolCall,
};
use bytes::BytesMut;
use tokio::sync::mpsc;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A transport handle the router can deliver frames to.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Subscriber {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, frame: ServerMessage) -> bool {
        self.tx.send(frame).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Live messages arrive through `push_message`.
    Push,
    /// New log lines are picked up by the poll cycle.
    Poll,
    /// Parked until someone subscribes again.
    Idle,
}

pub(crate) struct SubscriberSlot {
    pub handle: Subscriber,
    /// Frames held back while this subscriber's file replay is in flight.
    pub backlog: Option<Vec<ServerMessage>>,
}

impl SubscriberSlot {
    pub fn deliver(&mut self, frame: &ServerMessage) {
        match &mut self.backlog {
            Some(backlog) => backlog.push(frame.clone()),
            None => {
                self.handle.send(frame.clone());
            }
        }
    }
}

/// Log tail position. `generation` changes whenever the position is
/// rewritten outside the poll cycle, invalidating reads started before.
#[derive(Debug, Default)]
pub(crate) struct TailCursor {
    pub path: Option<PathBuf>,
    pub offset: u64,
    pub carry: BytesMut,
    pub generation: u64,
    /// Earliest next lookup while `path` is unknown.
    pub path_retry_at: Option<Instant>,
}

impl TailCursor {
    pub fn reset_to(&mut self, offset: u64) {
        self.offset = offset;
        self.carry.clear();
        self.generation += 1;
    }
}

/// Transient state buffered for late joiners
#[derive(Debug, Default, Clone)]
pub(crate) struct EphemeralState {
    pub pending_reasoning: String,
    /// Active sub-tasks in start order.
    pub subagents: Vec<SubagentTask>,
    pub compacting: bool,
    pub context_usage: Option<ContextUsage>,
    pub git_diff: Option<GitDiffSnapshot>,
    pub permission_mode: Option<PermissionMode>,
}

impl EphemeralState {
    /// Fold an event into the buffered state. Returns `false` when the event
    /// should be dropped instead of broadcast.
    pub fn apply(&mut self, event: &ServerMessage) -> bool {
        match event {
            ServerMessage::ThinkingDelta { text } => self.pending_reasoning.push_str(text),
            ServerMessage::PermissionMode { mode } => self.permission_mode = Some(*mode),
            ServerMessage::Compacting { is_compacting } => self.compacting = *is_compacting,
            ServerMessage::ContextUsage { usage } => self.context_usage = Some(usage.clone()),
            ServerMessage::GitDiff { diff } => self.git_diff = Some(diff.clone()),
            ServerMessage::SubagentStarted {
                tool_use_id,
                description,
                subagent_type,
                started_at,
            } => {
                self.subagents.retain(|t| &t.tool_use_id != tool_use_id);
                self.subagents.push(SubagentTask {
                    tool_use_id: tool_use_id.clone(),
                    description: description.clone(),
                    subagent_type: subagent_type.clone(),
                    tool_calls: Vec::new(),
                    started_at: started_at.clone(),
                });
            }
            ServerMessage::SubagentToolCall {
                parent_tool_use_id,
                call,
            } => return self.record_tool_call(parent_tool_use_id, call),
            ServerMessage::SubagentCompleted { tool_use_id } => {
                self.subagents.retain(|t| &t.tool_use_id != tool_use_id)
            }
            ServerMessage::Status { status, .. } if status.is_terminal() => self.clear_on_terminal(),
            _ => {}
        }
        true
    }

    fn record_tool_call(&mut self, parent_tool_use_id: &str, call: &SubagentToolCall) -> bool {
        match self
            .subagents
            .iter_mut()
            .find(|t| t.tool_use_id == parent_tool_use_id)
        {
            Some(task) => {
                task.tool_calls.push(call.clone());
                true
            }
            None => false,
        }
    }

    /// Context usage and permission mode outlive the run.
    pub fn clear_on_terminal(&mut self) {
        self.pending_reasoning.clear();
        self.subagents.clear();
        self.compacting = false;
        self.git_diff = None;
    }

    /// Replay frames for the non-empty fields, in delivery order.
    pub fn frames(&self) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        if let Some(mode) = self.permission_mode {
            frames.push(ServerMessage::PermissionMode { mode });
        }
        if !self.pending_reasoning.is_empty() {
            frames.push(ServerMessage::ThinkingDelta {
                text: self.pending_reasoning.clone(),
            });
        }
        for task in &self.subagents {
            frames.push(ServerMessage::SubagentStarted {
                tool_use_id: task.tool_use_id.clone(),
                description: task.description.clone(),
                subagent_type: task.subagent_type.clone(),
                started_at: task.started_at.clone(),
            });
            for call in &task.tool_calls {
                frames.push(ServerMessage::SubagentToolCall {
                    parent_tool_use_id: task.tool_use_id.clone(),
                    call: call.clone(),
                });
            }
        }
        if self.compacting {
            frames.push(ServerMessage::Compacting {
                is_compacting: true,
            });
        }
        if let Some(usage) = &self.context_usage {
            frames.push(ServerMessage::ContextUsage {
                usage: usage.clone(),
            });
        }
        if let Some(diff) = &self.git_diff {
            frames.push(ServerMessage::GitDiff { diff: diff.clone() });
        }
        frames
    }
}

/// A session the router tracks
pub(crate) struct WatchedSession {
    /// Position in this log is the message index.
    pub messages: Vec<NormalizedMessage>,
    pub subscribers: Vec<SubscriberSlot>,
    pub mode: DeliveryMode,
    pub cursor: TailCursor,
    pub ephemeral: EphemeralState,
    pub cwd: Option<PathBuf>,
    pub diff_in_flight: bool,
}

impl WatchedSession {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            messages: Vec::new(),
            subscribers: Vec::new(),
            mode,
            cursor: TailCursor::default(),
            ephemeral: EphemeralState::default(),
            cwd: None,
            diff_in_flight: false,
        }
    }

    pub fn broadcast(&mut self, frame: &ServerMessage) {
        self.subscribers.retain(|slot| slot.handle.is_open());
        for slot in &mut self.subscribers {
            slot.deliver(frame);
        }
    }

    /// Append at the next index and broadcast. Returns the stamped message.
    pub fn append(&mut self, mut message: NormalizedMessage) -> NormalizedMessage {
        message.index = self.messages.len();
        if message.finalized_reasoning().is_some() {
            self.ephemeral.pending_reasoning.clear();
        }
        if let Some(cwd) = &message.cwd {
            self.cwd = Some(PathBuf::from(cwd));
        }
        self.messages.push(message.clone());
        self.broadcast(&ServerMessage::Message {
            message: message.clone(),
        });
        message
    }

    pub fn has_subscriber(&self, subscriber_id: u64) -> bool {
        self.subscribers
            .iter()
            .any(|slot| slot.handle.id() == subscriber_id)
    }

    pub fn slot_mut(&mut self, subscriber_id: u64) -> Option<&mut SubscriberSlot> {
        self.subscribers
            .iter_mut()
            .find(|slot| slot.handle.id() == subscriber_id)
    }

    pub fn is_disposable(&self) -> bool {
        self.subscribers.is_empty() && self.messages.is_empty()
    }
}

/// Message frames for the most recent `limit` entries of `log`, plus the
/// index of the oldest one returned.
pub(crate) fn message_replay(
    log: &[NormalizedMessage],
    limit: Option<usize>,
) -> (Vec<ServerMessage>, usize) {
    let start = limit.map_or(0, |limit| log.len().saturating_sub(limit));
    let frames = log[start..]
        .iter()
        .map(|message| ServerMessage::Message {
            message: message.clone(),
        })
        .collect();
    (frames, start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_protocol::{MessageKind, SessionStatus};
    use serde_json::json;

    fn started(id: &str) -> ServerMessage {
        ServerMessage::SubagentStarted {
            tool_use_id: id.into(),
            description: "explore".into(),
            subagent_type: "Explore".into(),
            started_at: "1Z".into(),
        }
    }

    fn tool_call(parent: &str) -> ServerMessage {
        ServerMessage::SubagentToolCall {
            parent_tool_use_id: parent.into(),
            call: SubagentToolCall {
                tool_name: "Grep".into(),
                tool_use_id: None,
                input: json!({}),
            },
        }
    }

    #[test]
    fn tool_call_for_unknown_subagent_is_dropped() {
        let mut state = EphemeralState::default();
        assert!(!state.apply(&tool_call("ghost")));
        assert!(state.apply(&started("t1")));
        assert!(state.apply(&tool_call("t1")));
        assert_eq!(state.subagents[0].tool_calls.len(), 1);
    }

    #[test]
    fn terminal_status_keeps_usage_and_mode() {
        let mut state = EphemeralState::default();
        state.apply(&ServerMessage::ThinkingDelta { text: "a".into() });
        state.apply(&started("t1"));
        state.apply(&ServerMessage::Compacting {
            is_compacting: true,
        });
        state.apply(&ServerMessage::ContextUsage {
            usage: ContextUsage {
                input_tokens: 5,
                ..ContextUsage::default()
            },
        });
        state.apply(&ServerMessage::GitDiff {
            diff: GitDiffSnapshot::default(),
        });
        state.apply(&ServerMessage::PermissionMode {
            mode: PermissionMode::Plan,
        });

        state.apply(&ServerMessage::status(SessionStatus::Completed, None));

        let frames = state.frames();
        assert_eq!(
            frames,
            vec![
                ServerMessage::PermissionMode {
                    mode: PermissionMode::Plan
                },
                ServerMessage::ContextUsage {
                    usage: ContextUsage {
                        input_tokens: 5,
                        ..ContextUsage::default()
                    }
                },
            ]
        );
    }

    #[test]
    fn frames_follow_fixed_order() {
        let mut state = EphemeralState::default();
        state.apply(&ServerMessage::GitDiff {
            diff: GitDiffSnapshot::default(),
        });
        state.apply(&ServerMessage::Compacting {
            is_compacting: true,
        });
        state.apply(&started("t1"));
        state.apply(&tool_call("t1"));
        state.apply(&ServerMessage::ThinkingDelta { text: "x".into() });
        state.apply(&ServerMessage::ThinkingDelta { text: "y".into() });

        let kinds: Vec<String> = state
            .frames()
            .iter()
            .map(|f| serde_json::to_value(f).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "thinking_delta",
                "subagent_started",
                "subagent_tool_call",
                "compacting",
                "git_diff"
            ]
        );
        assert_eq!(
            state.frames()[0],
            ServerMessage::ThinkingDelta { text: "xy".into() }
        );
    }

    #[test]
    fn subagent_completion_removes_entry() {
        let mut state = EphemeralState::default();
        state.apply(&started("t1"));
        state.apply(&ServerMessage::SubagentCompleted {
            tool_use_id: "t1".into(),
        });
        assert!(state.subagents.is_empty());
    }

    #[test]
    fn append_restamps_index_and_clears_reasoning() {
        let mut watched = WatchedSession::new(DeliveryMode::Push);
        watched.ephemeral.pending_reasoning = "streaming".into();

        let mut first = NormalizedMessage::text(MessageKind::User, "hi");
        first.index = 42;
        assert_eq!(watched.append(first).index, 0);
        assert_eq!(watched.ephemeral.pending_reasoning, "streaming");

        let mut reply = NormalizedMessage::text(MessageKind::Assistant, "done");
        reply.reasoning = Some("final".into());
        assert_eq!(watched.append(reply).index, 1);
        assert!(watched.ephemeral.pending_reasoning.is_empty());
    }

    #[test]
    fn backlogged_slot_holds_frames() {
        let (handle, mut rx) = Subscriber::channel();
        let mut slot = SubscriberSlot {
            handle,
            backlog: Some(Vec::new()),
        };
        slot.deliver(&ServerMessage::Ping);
        assert!(rx.try_recv().is_err());
        assert_eq!(slot.backlog.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn broadcast_drops_closed_subscribers() {
        let mut watched = WatchedSession::new(DeliveryMode::Push);
        let (open, mut open_rx) = Subscriber::channel();
        let (closed, closed_rx) = Subscriber::channel();
        drop(closed_rx);
        for handle in [open, closed] {
            watched.subscribers.push(SubscriberSlot {
                handle,
                backlog: None,
            });
        }
        watched.broadcast(&ServerMessage::Ping);
        assert_eq!(watched.subscribers.len(), 1);
        assert_eq!(open_rx.try_recv().unwrap(), ServerMessage::Ping);
    }

    #[test]
    fn replay_limit_selects_most_recent() {
        let log: Vec<NormalizedMessage> = (0..3)
            .map(|i| {
                let mut m = NormalizedMessage::text(MessageKind::User, format!("m{i}"));
                m.index = i;
                m
            })
            .collect();
        let (frames, oldest) = message_replay(&log, Some(2));
        assert_eq!(frames.len(), 2);
        assert_eq!(oldest, 1);
        let (frames, oldest) = message_replay(&log, None);
        assert_eq!((frames.len(), oldest), (3, 0));
        let (frames, oldest) = message_replay(&log, Some(10));
        assert_eq!((frames.len(), oldest), (3, 0));
    }
}
