//! Configuration for the device agent.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;

use crate::asset::AssetManagerConfig;
use crate::service::ServiceConfig;

/// Device agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Root directory that file assets are installed under.
    pub assets_dir: PathBuf,

    /// Durable asset snapshot.
    pub asset_state_file: PathBuf,

    /// Management backend base URL.
    pub backend_url: String,

    /// Bearer token for backend requests.
    pub access_token: Option<String>,

    /// Working directory of the managed flow service.
    pub service_dir: PathBuf,

    /// Directory holding the service's flow and credential files.
    pub service_data_dir: PathBuf,

    /// Command line used to launch the service.
    pub service_command: String,

    /// Signal sent to stop the service.
    pub service_kill_signal: String,

    /// PID file written while the service runs.
    pub service_pid_file: PathBuf,

    /// Whether flow packages may start an editor session.
    pub allow_edit_sessions: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(
            std::env::var("AGENT_DATA_DIR").unwrap_or_else(|_| "/var/lib/fleet-agent".to_string()),
        );

        let assets_dir = std::env::var("AGENT_ASSETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("assets"));

        let asset_state_file = std::env::var("AGENT_ASSET_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("asset-state.json"));

        let backend_url = std::env::var("AGENT_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let access_token = std::env::var("AGENT_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let service_dir = std::env::var("AGENT_SERVICE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("service"));

        let service_data_dir = std::env::var("AGENT_SERVICE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| service_dir.join(".flow-data"));

        let service_command = std::env::var("AGENT_SERVICE_COMMAND").unwrap_or_else(|_| {
            "./node_modules/.bin/node-red -s .flow-data/settings.js".to_string()
        });

        let service_kill_signal =
            std::env::var("AGENT_SERVICE_KILL_SIGNAL").unwrap_or_else(|_| "SIGINT".to_string());

        let service_pid_file = std::env::var("AGENT_SERVICE_PID_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("service.pid"));

        let allow_edit_sessions = match std::env::var("AGENT_ALLOW_EDIT_SESSIONS") {
            Ok(raw) => parse_bool(&raw)
                .with_context(|| format!("Invalid AGENT_ALLOW_EDIT_SESSIONS: {raw}"))?,
            Err(_) => false,
        };

        let log_level = std::env::var("AGENT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            data_dir,
            assets_dir,
            asset_state_file,
            backend_url,
            access_token,
            service_dir,
            service_data_dir,
            service_command,
            service_kill_signal,
            service_pid_file,
            allow_edit_sessions,
            log_level,
        })
    }
}

impl Config {
    pub fn asset_manager_config(&self) -> AssetManagerConfig {
        AssetManagerConfig {
            data_dir: self.assets_dir.clone(),
            state_file: self.asset_state_file.clone(),
            ..AssetManagerConfig::default()
        }
    }

    pub fn service_config(&self) -> Result<ServiceConfig> {
        let kill_signal = Signal::from_str(&self.service_kill_signal).with_context(|| {
            format!("Invalid AGENT_SERVICE_KILL_SIGNAL: {}", self.service_kill_signal)
        })?;

        Ok(ServiceConfig {
            dir: self.service_dir.clone(),
            data_dir: self.service_data_dir.clone(),
            command: self.service_command.clone(),
            kill_signal,
            pid_file: self.service_pid_file.clone(),
            assets_data_path: self.assets_dir.clone(),
            allow_edit_sessions: self.allow_edit_sessions,
            ..ServiceConfig::default()
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("true", true)]
    #[case("1", true)]
    #[case(" YES ", true)]
    #[case("false", false)]
    #[case("0", false)]
    #[case("", false)]
    fn test_parse_bool(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(parse_bool(raw).unwrap(), expected);
    }

    #[test]
    fn test_parse_bool_rejects_garbage() {
        assert!(parse_bool("maybe").is_err());
    }

    fn config() -> Config {
        let data_dir = PathBuf::from("/tmp/agent");
        Config {
            assets_dir: data_dir.join("assets"),
            asset_state_file: data_dir.join("asset-state.json"),
            backend_url: "http://127.0.0.1:8080".to_string(),
            access_token: None,
            service_dir: data_dir.join("service"),
            service_data_dir: data_dir.join("service/.flow-data"),
            service_command: "node-red".to_string(),
            service_kill_signal: "SIGTERM".to_string(),
            service_pid_file: data_dir.join("service.pid"),
            allow_edit_sessions: true,
            log_level: "info".to_string(),
            data_dir,
        }
    }

    #[test]
    fn test_component_configs() {
        let config = config();

        let assets = config.asset_manager_config();
        assert_eq!(assets.data_dir, PathBuf::from("/tmp/agent/assets"));
        assert_eq!(assets.state_file, PathBuf::from("/tmp/agent/asset-state.json"));

        let service = config.service_config().unwrap();
        assert_eq!(service.kill_signal, Signal::SIGTERM);
        assert_eq!(service.assets_data_path, PathBuf::from("/tmp/agent/assets"));
        assert!(service.allow_edit_sessions);
    }

    #[test]
    fn test_invalid_kill_signal() {
        let mut config = config();
        config.service_kill_signal = "SIGNOPE".to_string();
        assert!(config.service_config().is_err());
    }
}
