use agentrelay_connector_core::ConnectorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session capacity reached ({max} sessions)")]
    Capacity { max: usize },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is already running")]
    Busy(String),

    #[error("No matching pending approval")]
    NoPendingApproval,

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Busy(_) | SessionError::NoPendingApproval => StatusCode::CONFLICT,
            SessionError::Connector(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            SessionError::Connector(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}
