//! Desired-state feed for flow deployments.
//!
//! Watches the desired `flow` entry (`{updateId, downloadUrl}`) and hands new
//! targets to the service controller, reporting progress under the reported
//! `flow` path.

use std::sync::Arc;

use chrono::Utc;
use fleet_device_state::{DeviceStateStore, Scope, StateChange, UpdateOp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ServiceHandle;

/// Desired and reported path of the flow entry.
pub const FLOW_PATH: &str = "flow";

/// Flow target declared by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTarget {
    pub update_id: String,
    pub download_url: String,
}

/// Reported flow deployment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowState {
    DeployPending,
    Deploying,
    Deployed,
    DeployFail,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::DeployPending => "deployPending",
            FlowState::Deploying => "deploying",
            FlowState::Deployed => "deployed",
            FlowState::DeployFail => "deployFail",
        }
    }
}

/// Forwards desired flow changes to the service controller.
pub struct FlowFeed {
    store: Arc<dyn DeviceStateStore>,
    service: ServiceHandle,
    last_update_id: Option<String>,
}

impl FlowFeed {
    /// A flow already reported as deployed is not deployed again.
    pub fn new(store: Arc<dyn DeviceStateStore>, service: ServiceHandle) -> Self {
        let last_update_id = store
            .get(Scope::Reported, FLOW_PATH)
            .filter(|flow| flow.get("state").and_then(Value::as_str) == Some("deployed"))
            .and_then(|flow| flow.get("updateId").and_then(Value::as_str).map(String::from));
        Self {
            store,
            service,
            last_update_id,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let events = self.store.subscribe();
        tokio::spawn(self.run(events, shutdown))
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<StateChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Flow feed started");
        self.check().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                event = events.recv() => match event {
                    Ok(change) if change.touches(Scope::Desired, FLOW_PATH) => self.check().await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Flow feed lagged behind state changes");
                        self.check().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("State change feed closed");
                        break;
                    }
                },
            }
        }

        info!("Flow feed stopped");
    }

    async fn check(&mut self) {
        let Some(value) = self.store.get(Scope::Desired, FLOW_PATH) else {
            return;
        };
        let target: FlowTarget = match serde_json::from_value(value) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Ignoring invalid desired flow");
                return;
            }
        };
        if self.last_update_id.as_deref() == Some(target.update_id.as_str()) {
            return;
        }

        info!(update_id = %target.update_id, "New flow requested");
        self.last_update_id = Some(target.update_id.clone());
        self.report(&target.update_id, FlowState::DeployPending);
        self.report(&target.update_id, FlowState::Deploying);

        let state = match self.service.deploy_flow(target.download_url.as_str()).await {
            Ok(()) => FlowState::Deployed,
            Err(e) => {
                error!(update_id = %target.update_id, error = %e, "Flow deploy failed");
                FlowState::DeployFail
            }
        };
        self.report(&target.update_id, state);
    }

    fn report(&self, update_id: &str, state: FlowState) {
        let value = json!({
            "updateId": update_id,
            "state": state.as_str(),
            "ts": Utc::now().timestamp_millis(),
        });
        if let Err(e) = self
            .store
            .update(Scope::Reported, UpdateOp::Set, FLOW_PATH, Some(value))
        {
            error!(error = %e, "Failed to report flow state");
        }
    }
}
