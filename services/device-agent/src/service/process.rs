//! Child process plumbing for the managed service.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use reqwest::Client;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::{EditSession, ServiceConfig, ServiceError};

/// Marker line the flow runtime prints once flows are running.
const FLOWS_STARTED_MARKER: &str = "Started flows";

const EDITOR_PING_PATH: &str = "/api/v1/agent-editor/ping";

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Spawn the service with piped output forwarded to the log.
pub fn spawn_service(
    config: &ServiceConfig,
    edit_session: Option<&EditSession>,
    client: &Client,
) -> Result<Child, ServiceError> {
    let mut parts = config.command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| ServiceError::InvalidCommand(config.command.clone()))?;

    let mut command = Command::new(program);
    command
        .current_dir(&config.dir)
        .env("AGENT_ASSETS_DATA_PATH", &config.assets_data_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match edit_session {
        Some(session) => {
            command
                .args(&config.editor_args)
                .env("AGENT_EDITOR_URL", session.editor_url(config.editor_port))
                .env("AGENT_EDITOR_SESSION_TOKEN", &session.session_token);
        }
        None => {
            command.args(parts);
        }
    }

    let mut child = command.spawn().map_err(|source| ServiceError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(stdout) = child.stdout.take() {
        let ping = edit_session.map(|session| EditorPing {
            url: format!("{}{}", session.editor_url(config.editor_port), EDITOR_PING_PATH),
            token: session.session_token.clone(),
            client: client.clone(),
        });
        tokio::spawn(forward_stdout(stdout, ping));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr));
    }

    Ok(child)
}

struct EditorPing {
    url: String,
    token: String,
    client: Client,
}

impl EditorPing {
    async fn send(self) {
        info!(target: "service", url = %self.url, "Pinging editor");
        let result = self
            .client
            .post(&self.url)
            .header("x-ee-session", &self.token)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url = %self.url, "Editor ping accepted");
            }
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "Editor ping rejected");
            }
            Err(e) => error!(url = %self.url, error = %e, "Editor ping failed"),
        }
    }
}

async fn forward_stdout<R: AsyncRead + Unpin>(reader: R, mut ping: Option<EditorPing>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "service", "{line}");
        if line.contains(FLOWS_STARTED_MARKER) {
            if let Some(ping) = ping.take() {
                tokio::spawn(ping.send());
            }
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        error!(target: "service", "{line}");
    }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn signal_process(pid: u32, signal: Signal) -> Result<(), ServiceError> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_pid_file(path: &Path, pid: u32) {
    if let Err(e) = std::fs::write(path, pid.to_string()) {
        error!(path = %path.display(), error = %e, "Failed to write PID file");
    }
}

pub fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), error = %e, "Failed to remove PID file"),
    }
}

/// Kill the process named by a leftover PID file, then remove the file.
pub fn kill_stale_process(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 1 && pid != std::process::id() => {
            warn!(pid, "Killing process from stale PID file");
            if let Err(e) = signal_process(pid, Signal::SIGKILL) {
                error!(pid, error = %e, "Failed to kill stale process");
            }
        }
        _ => warn!(path = %path.display(), "Ignoring unreadable PID file"),
    }
    remove_pid_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_info() {
        let ok = ExitInfo {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        assert_eq!(ok.to_string(), "code 0");

        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "signal 9");
    }

    #[tokio::test]
    async fn test_stale_pid_file_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("service.pid");

        let mut victim = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = victim.id().unwrap();
        std::fs::write(&pid_file, format!("{pid}\n")).unwrap();

        kill_stale_process(&pid_file);

        let status = tokio::time::timeout(Duration::from_secs(5), victim.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ExitInfo::from(status).signal, Some(Signal::SIGKILL as i32));
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("service.pid");
        std::fs::write(&pid_file, "not-a-pid").unwrap();
        kill_stale_process(&pid_file);
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_signal_reaped_process_is_ok() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(signal_process(pid, Signal::SIGTERM).is_ok());
    }
}
