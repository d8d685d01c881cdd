//! WebSocket handling
//!
//! One socket observes one session. The socket's outbound channel is the
//! router subscriber, so replay, live frames, pings and per-socket errors
//! share a single ordered queue.

use std::sync::atomic::{AtomicU64, Ordering};

use agentrelay_protocol::{ClientMessage, ServerMessage, SessionStatus, StatusSource};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::registry::Registry;
use crate::router::Subscriber;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketQuery {
    pub replay_limit: Option<usize>,
}

enum Outbound {
    Frame(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<SocketQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.replay_limit))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    replay_limit: Option<usize>,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    // Observers may still hold a pre-remap id.
    let watch_id = state
        .registry
        .resolve(&session_id)
        .unwrap_or_else(|| session_id.clone());
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %watch_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (subscriber, mut frames) = Subscriber::channel();
    let subscriber_id = subscriber.id();
    let client = subscriber.clone();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Bytes>();

    let ping_interval = state.ping_interval;
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            let outbound = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => Outbound::Frame(frame),
                    None => break,
                },
                Some(data) = pong_rx.recv() => Outbound::Pong(data),
                _ = ping.tick() => Outbound::Frame(ServerMessage::Ping),
            };

            let result = match outbound {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    client.send(initial_status(&state.registry, &watch_id));
    state.router.subscribe(&watch_id, subscriber, replay_limit).await;

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.send(data);
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    "Failed to parse client message"
                );
                client.send(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                continue;
            }
        };

        if let Err(e) = handle_client_message(client_msg, &watch_id, &state) {
            debug!(
                component = "websocket",
                event = "ws.message.rejected",
                connection_id = conn_id,
                session_id = %watch_id,
                error = %e,
                "Client request rejected"
            );
            client.send(ServerMessage::Error {
                message: e.to_string(),
            });
        }
    }

    // Closing a socket never cancels the run.
    state.router.unsubscribe(&watch_id, subscriber_id);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %watch_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// First frame on a socket: live status from the registry, else history.
fn initial_status(registry: &Registry, session_id: &str) -> ServerMessage {
    match registry.with_session(session_id, |s| (s.status, s.last_error.clone())) {
        Some((status, last_error)) => {
            let error = last_error.filter(|_| status == SessionStatus::Error);
            ServerMessage::status(status, error)
        }
        None => ServerMessage::Status {
            status: SessionStatus::History,
            error: None,
            source: StatusSource::History,
        },
    }
}

fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    state: &AppState,
) -> Result<(), SessionError> {
    match msg {
        ClientMessage::Prompt { text } => state.runner.send_prompt(session_id, text),
        ClientMessage::Approve {
            tool_use_id,
            always_allow,
            answers,
            updated_input,
        } => state
            .runner
            .approve(session_id, &tool_use_id, always_allow, answers, updated_input),
        ClientMessage::Deny {
            tool_use_id,
            message,
        } => state.runner.deny(session_id, &tool_use_id, message),
        ClientMessage::Interrupt => state.runner.interrupt(session_id),
        ClientMessage::SetPermissionMode { mode } => {
            state.runner.set_permission_mode(session_id, mode)
        }
    }
}
