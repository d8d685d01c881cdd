//! Session router
//!
//! Per-session mailbox and fan-out point. Messages reach a session either
//! live (`push_message`, while a runner drives it) or from its append-only
//! log file (the poll cycle). Every message is stamped with its position in
//! the session's in-memory log, and each subscriber sees that log exactly
//! once, in index order: first as replay, then live.
//!
//! All map mutation happens under one synchronous lock that is never held
//! across an await. Async work (log reads, path resolution) snapshots what it
//! needs first and re-validates against the cursor generation afterwards.

mod session;
mod tail;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use agentrelay_connector_core::{AgentProvider, HistoryQuery};
use agentrelay_protocol::{GitDiffSnapshot, NormalizedMessage, ServerMessage, TaskItem};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::git::DiffSource;

pub use session::{DeliveryMode, Subscriber};
use session::{message_replay, SubscriberSlot, WatchedSession};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub poll_interval: Duration,
    /// Minimum gap between lookups of a log path that did not exist yet.
    pub path_retry_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            path_retry_interval: Duration::from_secs(2),
        }
    }
}

pub struct SessionRouter {
    sessions: Mutex<HashMap<String, WatchedSession>>,
    provider: Arc<dyn AgentProvider>,
    diff_source: Arc<dyn DiffSource>,
    config: RouterConfig,
}

/// What a poll pass needs to read one session's log.
struct PollTarget {
    session_id: String,
    path: PathBuf,
    offset: u64,
    generation: u64,
}

impl SessionRouter {
    pub fn new(
        provider: Arc<dyn AgentProvider>,
        diff_source: Arc<dyn DiffSource>,
        config: RouterConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            provider,
            diff_source,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WatchedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Replay a session's history to `subscriber`, then stream it live.
    pub async fn subscribe(&self, session_id: &str, subscriber: Subscriber, replay_limit: Option<usize>) {
        let subscriber_id = subscriber.id();

        let (known_path, ephemeral) = {
            let mut sessions = self.lock();
            let watched = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| WatchedSession::new(DeliveryMode::Poll));
            if watched.mode == DeliveryMode::Idle {
                // Parked: the next poll pass catches up from the old offset.
                watched.mode = DeliveryMode::Poll;
            }

            if !watched.messages.is_empty() {
                let (mut frames, oldest_index) = message_replay(&watched.messages, replay_limit);
                frames.extend(watched.ephemeral.frames());
                frames.push(ServerMessage::ReplayComplete {
                    total_messages: watched.messages.len(),
                    oldest_index,
                });
                for frame in frames {
                    subscriber.send(frame);
                }
                watched.subscribers.push(SubscriberSlot {
                    handle: subscriber,
                    backlog: None,
                });
                debug!(
                    component = "router",
                    event = "router.subscribe.memory_replay",
                    session_id = %session_id,
                    subscriber_id,
                    total_messages = watched.messages.len(),
                    "Replayed from memory"
                );
                return;
            }

            watched.subscribers.push(SubscriberSlot {
                handle: subscriber,
                backlog: Some(Vec::new()),
            });
            (watched.cursor.path.clone(), watched.ephemeral.frames())
        };

        // File replay. The subscriber is registered with a backlog, so
        // anything broadcast while we read is held, not lost.
        let path = match known_path {
            Some(path) => Some(path),
            None => self.provider.session_file_path(session_id).await,
        };
        let size_before = match &path {
            Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).ok(),
            None => None,
        };
        let page = match self.provider.get_messages(session_id, HistoryQuery::default()).await {
            Ok(page) => Some(page),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(
                    component = "router",
                    event = "router.subscribe.history_failed",
                    session_id = %session_id,
                    error = %err,
                    "History read failed, replaying nothing"
                );
                None
            }
        };

        let mut sessions = self.lock();
        let Some(watched) = locate_subscriber(&mut sessions, session_id, subscriber_id) else {
            debug!(
                component = "router",
                event = "router.subscribe.abandoned",
                session_id = %session_id,
                subscriber_id,
                "Subscriber left before replay finished"
            );
            return;
        };

        if watched.cursor.path.is_none() {
            watched.cursor.path = path;
        }

        let mut tasks: Vec<TaskItem> = Vec::new();
        if let Some(page) = page {
            tasks = page.tasks;
            if watched.messages.is_empty() {
                let end = page.end_offset.or(size_before).unwrap_or(0);
                // Seeding broadcasts too: subscribers already live see these
                // as new, and this one drops them from its backlog below.
                for message in page.messages {
                    watched.append(message);
                }
                if end >= watched.cursor.offset {
                    watched.cursor.reset_to(end);
                }
            }
        }

        let total_messages = watched.messages.len();
        let (mut frames, oldest_index) = message_replay(&watched.messages, replay_limit);
        if !tasks.is_empty() {
            frames.push(ServerMessage::Tasks { tasks });
        }
        frames.extend(ephemeral);
        frames.push(ServerMessage::ReplayComplete {
            total_messages,
            oldest_index,
        });

        let Some(slot) = watched.slot_mut(subscriber_id) else {
            return;
        };
        let backlog = slot.backlog.take().unwrap_or_default();
        for frame in frames {
            slot.handle.send(frame);
        }
        for frame in backlog {
            let replayed = matches!(&frame, ServerMessage::Message { message } if message.index < total_messages);
            if !replayed {
                slot.handle.send(frame);
            }
        }

        info!(
            component = "router",
            event = "router.subscribe.file_replay",
            session_id = %session_id,
            subscriber_id,
            total_messages,
            oldest_index,
            "Replayed from log"
        );
    }

    /// Drop `subscriber_id`, scanning all sessions when `session_id` is stale.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut sessions = self.lock();

        let key = if sessions
            .get(session_id)
            .is_some_and(|w| w.has_subscriber(subscriber_id))
        {
            Some(session_id.to_string())
        } else {
            sessions
                .iter()
                .find(|(_, w)| w.has_subscriber(subscriber_id))
                .map(|(key, _)| key.clone())
        };
        let Some(key) = key else {
            return;
        };

        let remove = match sessions.get_mut(&key) {
            Some(watched) => {
                watched
                    .subscribers
                    .retain(|slot| slot.handle.id() != subscriber_id);
                watched.is_disposable()
            }
            None => false,
        };
        if remove {
            sessions.remove(&key);
            debug!(
                component = "router",
                event = "router.session.dropped",
                session_id = %key,
                "Dropped empty watched session"
            );
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map_or(0, |w| w.subscribers.len())
    }

    pub fn is_watched(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    // -----------------------------------------------------------------------
    // Live delivery
    // -----------------------------------------------------------------------

    /// Append and broadcast a live message. Ignored unless the session is in push mode.
    pub fn push_message(self: &Arc<Self>, session_id: &str, message: NormalizedMessage) {
        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(session_id) else {
            return;
        };
        if watched.mode != DeliveryMode::Push {
            debug!(
                component = "router",
                event = "router.push.ignored",
                session_id = %session_id,
                mode = ?watched.mode,
                "Dropping pushed message outside push mode"
            );
            return;
        }
        let message = watched.append(message);
        if message.touches_files() {
            self.schedule_diff(session_id, watched);
        }
    }

    /// Broadcast a transient event and fold it into the buffered state.
    pub fn push_event(&self, session_id: &str, event: ServerMessage) {
        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(session_id) else {
            return;
        };
        if !watched.ephemeral.apply(&event) {
            warn!(
                component = "router",
                event = "router.event.dropped",
                session_id = %session_id,
                "Sub-task tool call for unknown sub-task"
            );
            return;
        }
        watched.broadcast(&event);
    }

    /// Set the delivery mode, creating the watched session if needed.
    pub fn set_mode(&self, session_id: &str, mode: DeliveryMode) {
        let mut sessions = self.lock();
        let watched = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| WatchedSession::new(mode));
        if watched.mode != mode {
            watched.mode = mode;
            // A read that started in the old mode must not commit.
            watched.cursor.generation += 1;
        }
    }

    pub fn mode(&self, session_id: &str) -> Option<DeliveryMode> {
        self.lock().get(session_id).map(|w| w.mode)
    }

    /// Record the working directory used for diff snapshots.
    pub fn set_cwd(&self, session_id: &str, cwd: PathBuf) {
        if let Some(watched) = self.lock().get_mut(session_id) {
            watched.cwd = Some(cwd);
        }
    }

    /// Hand a session from push to poll, starting the tail at the current end
    /// of its log so nothing already pushed is delivered again.
    pub async fn transition_to_poll(&self, session_id: &str) {
        let known_path = {
            let sessions = self.lock();
            let Some(watched) = sessions.get(session_id) else {
                return;
            };
            watched.cursor.path.clone()
        };

        let path = match known_path {
            Some(path) => Some(path),
            None => self.provider.session_file_path(session_id).await,
        };
        let size = match &path {
            Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        };

        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(session_id) else {
            return;
        };
        watched.mode = DeliveryMode::Poll;
        if path.is_some() {
            watched.cursor.path = path;
        }
        watched.cursor.reset_to(size);

        info!(
            component = "router",
            event = "router.session.poll",
            session_id = %session_id,
            offset = size,
            "Session switched to polling"
        );
    }

    /// Stop tailing a session nobody is watching. A later subscribe resumes
    /// the tail where it stopped.
    pub fn park(&self, session_id: &str) {
        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(session_id) else {
            return;
        };
        if watched.mode != DeliveryMode::Poll || !watched.subscribers.is_empty() {
            return;
        }
        watched.mode = DeliveryMode::Idle;
        debug!(
            component = "router",
            event = "router.session.parked",
            session_id = %session_id,
            offset = watched.cursor.offset,
            "Stopped tailing unwatched session"
        );
    }

    /// Move a watched session, subscribers included, to a new id.
    pub fn remap(&self, old_id: &str, new_id: &str) {
        let mut sessions = self.lock();
        let Some(mut watched) = sessions.remove(old_id) else {
            warn!(
                component = "router",
                event = "router.remap.unknown",
                old_session_id = %old_id,
                session_id = %new_id,
                "Remap for unwatched session"
            );
            return;
        };

        // The log path is derived from the id.
        watched.cursor.path = None;
        watched.cursor.path_retry_at = None;
        watched.cursor.generation += 1;
        watched.diff_in_flight = false;

        if let Some(existing) = sessions.remove(new_id) {
            for slot in existing.subscribers {
                if !watched.has_subscriber(slot.handle.id()) {
                    watched.subscribers.push(slot);
                }
            }
            if watched.messages.is_empty() {
                watched.messages = existing.messages;
            }
        }

        info!(
            component = "router",
            event = "router.session.remapped",
            old_session_id = %old_id,
            session_id = %new_id,
            subscribers = watched.subscribers.len(),
            "Watched session remapped"
        );
        sessions.insert(new_id.to_string(), watched);
    }

    // -----------------------------------------------------------------------
    // Poll cycle
    // -----------------------------------------------------------------------

    pub fn spawn_poller(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    /// One pass over every session in poll mode.
    pub async fn poll_once(self: &Arc<Self>) {
        let now = Instant::now();
        let mut targets = Vec::new();
        let mut unresolved = Vec::new();
        {
            let mut sessions = self.lock();
            for (id, watched) in sessions.iter_mut() {
                if watched.mode != DeliveryMode::Poll {
                    continue;
                }
                match &watched.cursor.path {
                    Some(path) => targets.push(PollTarget {
                        session_id: id.clone(),
                        path: path.clone(),
                        offset: watched.cursor.offset,
                        generation: watched.cursor.generation,
                    }),
                    None => {
                        if watched.cursor.path_retry_at.is_some_and(|at| at > now) {
                            continue;
                        }
                        watched.cursor.path_retry_at = Some(now + self.config.path_retry_interval);
                        unresolved.push((id.clone(), watched.cursor.generation));
                    }
                }
            }
        }

        futures::future::join(
            futures::future::join_all(targets.into_iter().map(|target| self.poll_session(target))),
            futures::future::join_all(
                unresolved
                    .into_iter()
                    .map(|(id, generation)| self.resolve_log_path(id, generation)),
            ),
        )
        .await;
    }

    /// Look up a log that did not exist when the session started polling.
    async fn resolve_log_path(&self, session_id: String, generation: u64) {
        let Some(path) = self.provider.session_file_path(&session_id).await else {
            return;
        };
        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(&session_id) else {
            return;
        };
        if watched.cursor.generation != generation || watched.cursor.path.is_some() {
            return;
        }
        // Whatever was already pushed live is in the log; tail what follows.
        let start = if watched.messages.is_empty() { 0 } else { size };
        watched.cursor.path = Some(path);
        watched.cursor.reset_to(start);
        info!(
            component = "router",
            event = "router.poll.path_resolved",
            session_id = %session_id,
            offset = start,
            "Found log for polled session"
        );
    }

    async fn poll_session(self: &Arc<Self>, target: PollTarget) {
        let size = match tokio::fs::metadata(&target.path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.reset_cursor(&target, 0);
                return;
            }
            Err(err) => {
                warn!(
                    component = "router",
                    event = "router.poll.stat_failed",
                    session_id = %target.session_id,
                    error = %err,
                    "Could not stat log, retrying next tick"
                );
                return;
            }
        };

        if size < target.offset {
            // Rewritten from scratch.
            self.reset_cursor(&target, 0);
            return;
        }
        if size == target.offset {
            return;
        }

        let bytes = match tail::read_range(&target.path, target.offset, size).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.reset_cursor(&target, 0);
                return;
            }
            Err(err) => {
                warn!(
                    component = "router",
                    event = "router.poll.read_failed",
                    session_id = %target.session_id,
                    error = %err,
                    "Could not read log, retrying next tick"
                );
                return;
            }
        };

        let mut sessions = self.lock();
        let Some(watched) = sessions.get_mut(&target.session_id) else {
            return;
        };
        if watched.cursor.generation != target.generation
            || watched.cursor.offset != target.offset
            || watched.mode != DeliveryMode::Poll
        {
            return;
        }

        watched.cursor.offset = size;
        watched.cursor.carry.extend_from_slice(&bytes);
        let lines = tail::take_complete_lines(&mut watched.cursor.carry);

        let mut appended = 0usize;
        let mut touched_files = false;
        for line in lines {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let index = watched.messages.len();
            if let Some(message) = self.provider.normalize_file_line(text, index) {
                let message = watched.append(message);
                touched_files |= message.touches_files();
                appended += 1;
            }
        }

        if appended > 0 {
            debug!(
                component = "router",
                event = "router.poll.appended",
                session_id = %target.session_id,
                appended,
                offset = size,
                "Tailed new log lines"
            );
        }
        if touched_files {
            self.schedule_diff(&target.session_id, watched);
        }
    }

    fn reset_cursor(&self, target: &PollTarget, offset: u64) {
        let mut sessions = self.lock();
        if let Some(watched) = sessions.get_mut(&target.session_id) {
            if watched.cursor.generation == target.generation {
                watched.cursor.reset_to(offset);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Diff snapshots
    // -----------------------------------------------------------------------

    fn schedule_diff(self: &Arc<Self>, session_id: &str, watched: &mut WatchedSession) {
        if watched.diff_in_flight {
            return;
        }
        let Some(cwd) = watched.cwd.clone() else {
            return;
        };
        watched.diff_in_flight = true;

        let router = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let diff = router.diff_source.diff(&cwd).await;
            router.finish_diff(&session_id, diff);
        });
    }

    fn finish_diff(&self, session_id: &str, diff: Option<GitDiffSnapshot>) {
        {
            let mut sessions = self.lock();
            let Some(watched) = sessions.get_mut(session_id) else {
                return;
            };
            watched.diff_in_flight = false;
        }
        if let Some(diff) = diff {
            self.push_event(session_id, ServerMessage::GitDiff { diff });
        }
    }
}

/// The watched session currently holding `subscriber_id`, preferring `session_id`.
fn locate_subscriber<'a>(
    sessions: &'a mut HashMap<String, WatchedSession>,
    session_id: &str,
    subscriber_id: u64,
) -> Option<&'a mut WatchedSession> {
    let key = if sessions
        .get(session_id)
        .is_some_and(|w| w.has_subscriber(subscriber_id))
    {
        session_id.to_string()
    } else {
        sessions
            .iter()
            .find(|(_, w)| w.has_subscriber(subscriber_id))
            .map(|(key, _)| key.clone())?
    };
    sessions.get_mut(&key)
}
