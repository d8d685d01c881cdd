//! agentrelay server
//!
//! Runs agent sessions and fans their message streams out to any number of
//! WebSocket observers.

mod api;
mod config;
mod error;
mod git;
mod logging;
mod registry;
mod router;
mod runner;
mod state;
mod websocket;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use agentrelay_connector_claude::ClaudeProvider;
use agentrelay_connector_core::AgentProvider;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::git::GitDiffSource;
use crate::registry::Registry;
use crate::router::SessionRouter;
use crate::runner::SessionRunner;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let logging = logging::init_logging(&config.log_dir())?;
    let _log_guard = logging.guard;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        bind = %config.bind,
        data_dir = %config.data_dir().display(),
        "Starting agentrelay"
    );

    let provider: Arc<dyn AgentProvider> = Arc::new(ClaudeProvider::new(
        config.claude_projects_dir(),
        config.claude_bin.clone(),
    ));
    let registry = Arc::new(Registry::new(config.registry_config()));
    let router = Arc::new(SessionRouter::new(
        provider.clone(),
        Arc::new(GitDiffSource),
        config.router_config(),
    ));
    let runner = Arc::new(SessionRunner::new(
        registry.clone(),
        router.clone(),
        provider.clone(),
    ));

    let sweeper = registry
        .clone()
        .spawn_sweeper(config.sweep_interval(), router.clone());
    let poller = router.clone().spawn_poller();

    let app = api::build_app(AppState {
        registry,
        router,
        runner,
        provider,
        ping_interval: config.ping_interval(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %config.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    poller.abort();
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            component = "server",
            event = "server.signal.failed",
            error = %e,
            "Could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
