//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::registry::RegistryConfig;
use crate::router::RouterConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "agentrelay")]
#[command(version)]
#[command(about = "Session router and lifecycle orchestrator for AI coding agents")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "AGENTRELAY_BIND", default_value = "127.0.0.1:4100")]
    pub bind: SocketAddr,

    /// Data directory for logs (default: ~/.agentrelay)
    #[arg(long, env = "AGENTRELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of live sessions
    #[arg(long, env = "AGENTRELAY_MAX_SESSIONS", default_value_t = 20)]
    pub max_sessions: usize,

    /// Seconds a finished session stays in the registry
    #[arg(long, env = "AGENTRELAY_SESSION_TTL_SECS", default_value_t = 3600)]
    pub session_ttl_secs: u64,

    #[arg(long, env = "AGENTRELAY_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Log-file poll interval in milliseconds
    #[arg(long, env = "AGENTRELAY_POLL_INTERVAL_MS", default_value_t = 200)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "AGENTRELAY_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Claude transcript root (default: ~/.claude/projects)
    #[arg(long, env = "AGENTRELAY_CLAUDE_PROJECTS_DIR")]
    pub claude_projects_dir: Option<PathBuf>,

    /// Path to the claude binary
    #[arg(long, env = "CLAUDE_BIN")]
    pub claude_bin: Option<PathBuf>,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".agentrelay")
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn claude_projects_dir(&self) -> PathBuf {
        self.claude_projects_dir
            .clone()
            .or_else(agentrelay_connector_claude::TranscriptStore::default_projects_dir)
            .unwrap_or_else(|| self.data_dir().join("claude-projects"))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.max_sessions,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            ..RouterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::try_parse_from(["agentrelay"]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:4100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_sessions, 20);
        assert_eq!(config.registry_config().session_ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.router_config().poll_interval, Duration::from_millis(200));
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "agentrelay",
            "--bind",
            "0.0.0.0:9000",
            "--data-dir",
            "/tmp/relay",
            "--max-sessions",
            "3",
            "--poll-interval-ms",
            "50",
        ])
        .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/relay/logs"));
        assert_eq!(config.registry_config().max_sessions, 3);
        assert_eq!(config.router_config().poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn rejects_malformed_bind_address() {
        assert!(Config::try_parse_from(["agentrelay", "--bind", "nope"]).is_err());
    }
}
