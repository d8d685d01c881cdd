//! Application state

use std::sync::Arc;
use std::time::Duration;

use agentrelay_connector_core::AgentProvider;

use crate::registry::Registry;
use crate::router::SessionRouter;
use crate::runner::SessionRunner;

/// Shared handles for the HTTP and WebSocket handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub router: Arc<SessionRouter>,
    pub runner: Arc<SessionRunner>,
    pub provider: Arc<dyn AgentProvider>,
    pub ping_interval: Duration,
}
