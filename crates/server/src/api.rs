//! HTTP surface
//!
//! Thin JSON endpoints over the registry, runner and provider history.

use std::path::PathBuf;

use agentrelay_connector_core::{HistoryQuery, SessionListing};
use agentrelay_protocol::{NormalizedMessage, SessionSummary, TaskItem};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::SessionError;
use crate::runner::CreateSessionRequest;
use crate::state::AppState;
use crate::websocket::ws_handler;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/messages", get(get_messages))
        .route("/api/history", get(list_history))
        .route("/ws/sessions/{id}", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSummary>), SessionError> {
    let summary = state.runner.create(request)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.summaries())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, SessionError> {
    state
        .registry
        .summary(&id)
        .map(Json)
        .ok_or(SessionError::NotFound(id))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.runner.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesParams {
    pub before: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<NormalizedMessage>,
    pub tasks: Vec<TaskItem>,
    pub total_messages: usize,
    pub has_more: bool,
    pub oldest_index: usize,
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MessagesParams>,
) -> Result<Json<MessagesResponse>, SessionError> {
    let id = state.registry.resolve(&id).unwrap_or(id);
    let page = state
        .provider
        .get_messages(
            &id,
            HistoryQuery {
                before: params.before,
                limit: params.limit,
            },
        )
        .await?;
    Ok(Json(MessagesResponse {
        messages: page.messages,
        tasks: page.tasks,
        total_messages: page.total_messages,
        has_more: page.has_more,
        oldest_index: page.oldest_index,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl From<SessionListing> for HistoryEntry {
    fn from(listing: SessionListing) -> Self {
        Self {
            id: listing.id,
            path: listing.path.display().to_string(),
            cwd: listing.cwd,
            modified_at: listing.modified_at,
        }
    }
}

async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, SessionError> {
    let listings = state.provider.list_sessions(params.cwd.as_deref()).await?;
    Ok(Json(listings.into_iter().map(HistoryEntry::from).collect()))
}
