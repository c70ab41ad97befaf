//! Service controller actor.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_reconcile::{CrashLoopTracker, RestartDecision};
use nix::sys::signal::Signal;
use reqwest::Client;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::package;
use super::process::{self, ExitInfo};
use super::{EditSession, ServiceConfig, ServiceError, ServicePhase, ServiceStatus};
use crate::actors::{self, Actor, ActorContext, ActorError, ActorHandle};

const MAILBOX_SIZE: usize = 32;

/// Time allowed for a SIGKILLed child to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = oneshot::Sender<Result<(), ServiceError>>;

/// Messages handled by the [`ServiceController`].
#[derive(Debug)]
pub enum ServiceMessage {
    DeployFlow {
        url: String,
        reply: Reply,
    },
    Start {
        edit_session: Option<EditSession>,
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    Restart {
        reply: Reply,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
    /// A child process ended.
    Exited { child_id: u64, exit: ExitInfo },
    /// Delayed restart after an unexpected exit.
    AutoRestart {
        generation: u64,
        edit_session: Option<EditSession>,
    },
}

struct RunningChild {
    id: u64,
    pid: Option<u32>,
    exited: watch::Receiver<Option<ExitInfo>>,
    edit_session: Option<EditSession>,
}

enum ServiceState {
    Stopped,
    Starting(RunningChild),
    Running(RunningChild),
}

impl ServiceState {
    fn child(&self) -> Option<&RunningChild> {
        match self {
            ServiceState::Stopped => None,
            ServiceState::Starting(child) | ServiceState::Running(child) => Some(child),
        }
    }

    fn take_child(&mut self) -> Option<RunningChild> {
        match std::mem::replace(self, ServiceState::Stopped) {
            ServiceState::Stopped => None,
            ServiceState::Starting(child) | ServiceState::Running(child) => Some(child),
        }
    }

    fn phase(&self) -> ServicePhase {
        match self {
            ServiceState::Stopped => ServicePhase::Stopped,
            ServiceState::Starting(_) => ServicePhase::Starting,
            ServiceState::Running(_) => ServicePhase::Running,
        }
    }
}

/// Handle for driving a running [`ServiceController`].
#[derive(Clone)]
pub struct ServiceHandle {
    actor: ActorHandle<ServiceMessage>,
    status: watch::Receiver<ServiceStatus>,
}

impl ServiceHandle {
    /// Fetch, install, and run the flow package at `url`.
    pub async fn deploy_flow(&self, url: impl Into<String>) -> Result<(), ServiceError> {
        let url = url.into();
        self.actor
            .call(|reply| ServiceMessage::DeployFlow { url, reply })
            .await?
    }

    pub async fn start(&self, edit_session: Option<EditSession>) -> Result<(), ServiceError> {
        self.actor
            .call(|reply| ServiceMessage::Start {
                edit_session,
                reply,
            })
            .await?
    }

    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.actor
            .call(|reply| ServiceMessage::Stop { reply })
            .await?
    }

    pub async fn restart(&self) -> Result<(), ServiceError> {
        self.actor
            .call(|reply| ServiceMessage::Restart { reply })
            .await?
    }

    /// Status after every action queued before this one.
    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(self
            .actor
            .call(|reply| ServiceMessage::Status { reply })
            .await?)
    }

    /// Live status updates, including those caused by child exits.
    pub fn watch_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status.clone()
    }
}

/// Supervises the managed flow service.
pub struct ServiceController {
    config: ServiceConfig,
    client: Client,
    state: ServiceState,

    /// Bumped by every explicit action; stale auto-restarts compare against it.
    generation: u64,

    next_child_id: u64,
    crash: CrashLoopTracker,
    crash_looping: bool,
    status_tx: watch::Sender<ServiceStatus>,
    handle: Option<ActorHandle<ServiceMessage>>,
}

impl ServiceController {
    /// Fails when the service or data directory does not exist.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        for dir in [&config.dir, &config.data_dir] {
            if !dir.is_dir() {
                return Err(ServiceError::MissingDirectory(dir.clone()));
            }
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let (status_tx, _) = watch::channel(ServiceStatus::stopped());

        Ok(Self {
            crash: CrashLoopTracker::new(config.crash_policy),
            config,
            client,
            state: ServiceState::Stopped,
            generation: 0,
            next_child_id: 0,
            crash_looping: false,
            status_tx,
            handle: None,
        })
    }

    /// Start the actor.
    pub fn spawn(mut self, shutdown: watch::Receiver<bool>) -> (ServiceHandle, JoinHandle<()>) {
        let (handle, mailbox) = actors::mailbox("service", MAILBOX_SIZE);
        let status = self.status_tx.subscribe();
        self.handle = Some(handle.clone());
        let task = actors::spawn(self, mailbox, shutdown);
        (
            ServiceHandle {
                actor: handle,
                status,
            },
            task,
        )
    }

    fn status(&self) -> ServiceStatus {
        let child = self.state.child();
        ServiceStatus {
            phase: self.state.phase(),
            pid: child.and_then(|c| c.pid),
            editor_mode: child.map(|c| c.edit_session.is_some()).unwrap_or(false),
            consecutive_crashes: self.crash.consecutive(),
            crash_looping: self.crash_looping,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Mark an explicit action: pending auto-restarts become stale and the
    /// crash-loop budget starts over.
    fn explicit_action(&mut self) {
        self.generation += 1;
        self.crash = CrashLoopTracker::new(self.config.crash_policy);
        self.crash_looping = false;
    }

    async fn deploy_flow(&mut self, url: &str) -> Result<(), ServiceError> {
        info!("Updating flow");
        let package = package::fetch_package(&self.client, url).await?;

        let edit_session = package.requested_edit_session().cloned();
        if edit_session.is_some() && !self.config.allow_edit_sessions {
            warn!("Edit session flow deploy requested but not allowed");
            return Err(ServiceError::EditSessionNotAllowed);
        }

        package::write_package(&self.config.data_dir, &package).await?;
        package::install_dependencies(&self.config.dependency_command, &self.config.data_dir)
            .await?;

        match &edit_session {
            Some(session) => {
                info!(editor_ip = %session.ip_address, "Restarting service (editor mode)")
            }
            None => info!("Restarting service"),
        }
        self.stop_child().await?;
        self.start_child(edit_session).await
    }

    async fn start_child(&mut self, edit_session: Option<EditSession>) -> Result<(), ServiceError> {
        if let Some(child) = self.state.child() {
            info!(pid = ?child.pid, "Service already running");
            return Ok(());
        }

        if edit_session.is_some() {
            info!("Starting service (editor mode)");
        } else {
            info!("Starting service");
        }

        if self.config.pid_file.exists() {
            process::kill_stale_process(&self.config.pid_file);
        }

        let mut child = process::spawn_service(&self.config, edit_session.as_ref(), &self.client)?;
        let pid = child.id();
        if let Some(pid) = pid {
            process::write_pid_file(&self.config.pid_file, pid);
        }

        let id = self.next_child_id;
        self.next_child_id += 1;

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    error!(error = %e, "Failed to wait for service process");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            exit_tx.send_replace(Some(exit));
            if let Some(handle) = handle {
                let _ = handle
                    .send(ServiceMessage::Exited { child_id: id, exit })
                    .await;
            }
        });

        self.state = ServiceState::Starting(RunningChild {
            id,
            pid,
            exited: exit_rx,
            edit_session,
        });
        self.publish();

        tokio::time::sleep(self.config.startup_grace).await;

        self.state = match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Starting(child) if child.exited.borrow().is_none() => {
                info!(pid = ?child.pid, "Service started");
                ServiceState::Running(child)
            }
            other => other,
        };
        self.publish();
        Ok(())
    }

    async fn stop_child(&mut self) -> Result<(), ServiceError> {
        let Some(child) = self.state.take_child() else {
            info!("Service already shutdown");
            return Ok(());
        };

        info!(pid = ?child.pid, "Shutting down service");
        let mut exited = child.exited.clone();

        if exited.borrow().is_none() {
            if let Some(pid) = child.pid {
                if let Err(e) = process::signal_process(pid, self.config.kill_signal) {
                    error!(pid, error = %e, "Failed to signal service");
                }
            }

            let graceful = tokio::time::timeout(
                self.config.stop_timeout,
                exited.wait_for(Option::is_some),
            )
            .await
            .is_ok();

            if !graceful {
                warn!(pid = ?child.pid, "Service did not stop in time, killing");
                if let Some(pid) = child.pid {
                    process::signal_process(pid, Signal::SIGKILL)?;
                }
                let reaped = tokio::time::timeout(KILL_WAIT, exited.wait_for(Option::is_some))
                    .await
                    .is_ok();
                if !reaped {
                    error!(pid = ?child.pid, "Service process was not reaped after SIGKILL");
                }
            }
        }

        process::remove_pid_file(&self.config.pid_file);
        self.publish();
        info!("Service ended");
        Ok(())
    }

    fn on_exit(&mut self, child_id: u64, exit: ExitInfo) {
        if self.state.child().map(|c| c.id) != Some(child_id) {
            debug!(child_id, "Ignoring exit of a replaced service process");
            return;
        }
        let Some(child) = self.state.take_child() else {
            return;
        };
        process::remove_pid_file(&self.config.pid_file);
        info!(exit = %exit, "Service exited");

        if exit.success() {
            self.publish();
            return;
        }

        match self.crash.record_exit(Instant::now()) {
            RestartDecision::Restart { delay, consecutive } => {
                info!(
                    consecutive,
                    delay_ms = delay.as_millis() as u64,
                    "Unexpected exit, restarting service"
                );
                if let Some(handle) = self.handle.clone() {
                    let msg = ServiceMessage::AutoRestart {
                        generation: self.generation,
                        edit_session: child.edit_session,
                    };
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = handle.send(msg).await;
                    });
                }
            }
            RestartDecision::GiveUp { consecutive } => {
                warn!(consecutive, "Unexpected exit, but restart limit exceeded");
                self.crash_looping = true;
            }
        }
        self.publish();
    }

    async fn on_auto_restart(&mut self, generation: u64, edit_session: Option<EditSession>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Skipping stale auto-restart");
            return;
        }
        if let Err(e) = self.start_child(edit_session).await {
            error!(error = %e, "Automatic service restart failed");
        }
    }
}

#[async_trait]
impl Actor for ServiceController {
    type Message = ServiceMessage;

    fn name(&self) -> &str {
        "service"
    }

    async fn handle(
        &mut self,
        msg: ServiceMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            ServiceMessage::DeployFlow { url, reply } => {
                self.explicit_action();
                let result = self.deploy_flow(&url).await;
                if let Err(e) = &result {
                    error!(url = %url, error = %e, "Flow deploy failed");
                }
                let _ = reply.send(result);
            }
            ServiceMessage::Start {
                edit_session,
                reply,
            } => {
                self.explicit_action();
                let _ = reply.send(self.start_child(edit_session).await);
            }
            ServiceMessage::Stop { reply } => {
                self.explicit_action();
                let _ = reply.send(self.stop_child().await);
            }
            ServiceMessage::Restart { reply } => {
                self.explicit_action();
                info!("Restarting service");
                let result = match self.stop_child().await {
                    Ok(()) => self.start_child(None).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ServiceMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ServiceMessage::Exited { child_id, exit } => self.on_exit(child_id, exit),
            ServiceMessage::AutoRestart {
                generation,
                edit_session,
            } => self.on_auto_restart(generation, edit_session).await,
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        if let Err(e) = self.stop_child().await {
            error!(error = %e, "Failed to stop service on shutdown");
        }
    }
}
