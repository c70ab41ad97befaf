//! Managed flow service supervision.
//!
//! The [`ServiceController`] actor owns the flow runtime's child process.
//! Lifecycle actions (`deploy_flow`, `start`, `stop`, `restart`, `status`)
//! go through its mailbox and run strictly in submission order; every caller
//! awaits the result of its own action through [`ServiceHandle`].
//!
//! ```text
//! stopped ──start──▶ starting ──grace──▶ running
//!    ▲                   │                  │
//!    └──── exit / stop ──┴──────────────────┘
//! ```
//!
//! Unexpected exits feed a [`CrashLoopTracker`](fleet_reconcile::CrashLoopTracker);
//! restarts stop once exits keep happening within the crash window.

mod controller;
pub mod feed;
mod package;
mod process;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use fleet_reconcile::CrashLoopPolicy;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actors::ActorError;

pub use controller::{ServiceController, ServiceHandle};
pub use feed::FlowFeed;
pub use package::FlowPackage;

/// Errors from service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Required directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("Invalid service command: {0:?}")]
    InvalidCommand(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Flow package fetch failed with status {status}: {url}")]
    PackageFetch { url: String, status: u16 },

    #[error("Flow package requests an edit session, which this device does not allow")]
    EditSessionNotAllowed,

    #[error("Flow package request failed: {0}")]
    PackageRequest(#[from] reqwest::Error),

    #[error("Failed to encode flow package part: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Dependency install failed: {0}")]
    DependencyInstall(String),

    #[error("Signal error: {0}")]
    Signal(#[from] nix::Error),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Editor session requested by a flow package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSession {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub session_token: String,
}

impl EditSession {
    /// A session is only honoured when both fields are present.
    pub fn is_requested(&self) -> bool {
        !self.ip_address.is_empty() && !self.session_token.is_empty()
    }

    pub fn editor_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.ip_address, port)
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Working directory of the service.
    pub dir: PathBuf,

    /// Directory holding flow, credential, and dependency files.
    pub data_dir: PathBuf,

    /// Whitespace-separated command line.
    pub command: String,

    /// Arguments replacing the command's own in editor mode.
    pub editor_args: Vec<String>,

    /// Signal used for a graceful stop.
    pub kill_signal: Signal,

    pub pid_file: PathBuf,

    /// Exported to the service as `AGENT_ASSETS_DATA_PATH`.
    pub assets_data_path: PathBuf,

    pub allow_edit_sessions: bool,

    /// Run in `data_dir` after a package is written.
    pub dependency_command: String,

    /// Port of the remote editor.
    pub editor_port: u16,

    /// Time a fresh child must survive to count as running.
    pub startup_grace: Duration,

    /// Time allowed for a graceful stop before SIGKILL.
    pub stop_timeout: Duration,

    pub crash_policy: CrashLoopPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/fleet-agent/service"),
            data_dir: PathBuf::from("/var/lib/fleet-agent/service/.flow-data"),
            command: "./node_modules/.bin/node-red -s .flow-data/settings.js".to_string(),
            editor_args: vec![
                "-s".to_string(),
                ".flow-data/editor-settings.js".to_string(),
            ],
            kill_signal: Signal::SIGINT,
            pid_file: PathBuf::from("/var/lib/fleet-agent/service.pid"),
            assets_data_path: PathBuf::from("/var/lib/fleet-agent/assets"),
            allow_edit_sessions: false,
            dependency_command: "npm install agent-dynamic-deps".to_string(),
            editor_port: 9017,
            startup_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            crash_policy: CrashLoopPolicy::default(),
        }
    }
}

/// Supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    Stopped,
    Starting,
    Running,
}

/// Observable supervisor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub phase: ServicePhase,
    pub pid: Option<u32>,
    pub editor_mode: bool,
    /// Consecutive unexpected exits counted by the crash-loop tracker.
    pub consecutive_crashes: u32,
    /// Whether automatic restarts were abandoned.
    pub crash_looping: bool,
}

impl ServiceStatus {
    pub fn stopped() -> Self {
        Self {
            phase: ServicePhase::Stopped,
            pid: None,
            editor_mode: false,
            consecutive_crashes: 0,
            crash_looping: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.phase != ServicePhase::Stopped
    }
}
