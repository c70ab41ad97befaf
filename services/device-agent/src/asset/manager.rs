//! Asset reconciliation engine.
//!
//! The [`AssetManager`] diffs the desired `assets` tree against the assets it
//! owns, stages pending changes, and drains them one asset at a time.
//!
//! ## Concurrency
//!
//! A single worker task owns the collection. Store events that arrive while a
//! step runs stay buffered in the subscription and are absorbed between
//! steps, so overlapping triggers coalesce into the running drain instead of
//! starting a second one.
//!
//! ## Drain step
//!
//! 1. Drop assets with a pending remove that were never deployed
//! 2. Take the first pending change
//! 3. Apply it, publishing reported state after every transition
//! 4. Persist the snapshot
//! 5. Wait `step_delay`, absorbing desired-state events meanwhile

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_device_state::{path, DeviceStateStore, Scope, StateChange, UpdateOp};
use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::snapshot::AssetSnapshot;
use super::{Asset, AssetConfig, AssetContext, AssetDataResolver, AssetState, PendingChange};
use crate::transfer::{Downloader, DEFAULT_PROGRESS_INTERVAL, DEFAULT_READ_TIMEOUT};

/// Desired-state subtree the manager reacts to.
const DESIRED_PREFIX: &str = "assets";

/// Parent of the per-asset reported entries.
const REPORTED_PREFIX: &str = "assets.assets";

const COMMAND_CHANNEL_SIZE: usize = 16;

/// Asset manager configuration.
#[derive(Debug, Clone)]
pub struct AssetManagerConfig {
    /// Root directory assets are installed under.
    pub data_dir: PathBuf,

    /// Snapshot file.
    pub state_file: PathBuf,

    /// Pause between two processed assets.
    pub step_delay: Duration,

    /// Minimum time between download progress lines.
    pub progress_interval: Duration,

    /// A download fails once the server sends nothing for this long.
    pub download_read_timeout: Duration,
}

impl Default for AssetManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet-agent/assets"),
            state_file: PathBuf::from("/var/lib/fleet-agent/asset-state.json"),
            step_delay: Duration::from_secs(2),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            download_read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

enum ManagerCommand {
    /// Reply once buffered events are absorbed and the drain is idle.
    Sync(oneshot::Sender<()>),
    /// Reply with a copy of the collection.
    Assets(oneshot::Sender<Vec<Asset>>),
}

/// Handle to a running asset manager.
#[derive(Clone)]
pub struct AssetManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl AssetManagerHandle {
    /// Wait until every event already emitted by the store is processed.
    pub async fn sync(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Sync(reply))
            .await
            .map_err(|_| anyhow::anyhow!("asset manager stopped"))?;
        rx.await.context("asset manager dropped sync request")
    }

    /// Copy of the managed assets, in collection order.
    pub async fn assets(&self) -> Result<Vec<Asset>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Assets(reply))
            .await
            .map_err(|_| anyhow::anyhow!("asset manager stopped"))?;
        rx.await.context("asset manager dropped assets request")
    }
}

/// Owns and converges the device's assets.
pub struct AssetManager {
    config: AssetManagerConfig,
    store: Arc<dyn DeviceStateStore>,
    ctx: AssetContext,
    snapshot: AssetSnapshot,
    assets: Vec<Asset>,
}

impl AssetManager {
    pub fn new(
        config: AssetManagerConfig,
        store: Arc<dyn DeviceStateStore>,
        resolver: Arc<dyn AssetDataResolver>,
    ) -> Result<Self> {
        let downloader = Downloader::new(config.progress_interval, config.download_read_timeout)
            .context("Failed to build HTTP client")?;
        let ctx = AssetContext {
            data_dir: config.data_dir.clone(),
            resolver,
            downloader,
        };
        let snapshot = AssetSnapshot::new(config.state_file.clone());

        Ok(Self {
            config,
            store,
            ctx,
            snapshot,
            assets: Vec::new(),
        })
    }

    /// Create the data directory and restore the snapshot.
    ///
    /// The data directory is made absolute, since exec steps run with the
    /// asset's destination as working directory. A corrupt snapshot is
    /// logged and the collection starts empty.
    pub fn setup(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir).with_context(|| {
            format!(
                "Failed to create asset data directory: {}",
                self.config.data_dir.display()
            )
        })?;
        let data_dir = self.config.data_dir.canonicalize().with_context(|| {
            format!(
                "Failed to resolve asset data directory: {}",
                self.config.data_dir.display()
            )
        })?;
        self.ctx.data_dir = data_dir.clone();
        self.config.data_dir = data_dir;

        self.assets = match self.snapshot.load() {
            Ok(assets) => assets,
            Err(e) => {
                error!(error = %e, "Ignoring unreadable asset snapshot");
                Vec::new()
            }
        };
        Ok(())
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    /// Subscribe to the store and start the worker.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (AssetManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let events = self.store.subscribe();
        let task = tokio::spawn(self.run(events, rx, shutdown));
        (AssetManagerHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<StateChange>,
        mut commands: mpsc::Receiver<ManagerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(asset_count = self.assets.len(), "Asset manager started");
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Asset manager received shutdown signal");
                        break;
                    }
                }

                event = events.recv(), if events_open => {
                    let dirty = match event {
                        Ok(change) => is_relevant(&change),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Asset manager lagged behind state changes");
                            true
                        }
                        Err(RecvError::Closed) => {
                            debug!("State change feed closed");
                            events_open = false;
                            false
                        }
                    };
                    if dirty {
                        self.reconcile(&mut events, &mut shutdown).await;
                    }
                }

                cmd = commands.recv() => {
                    match cmd {
                        Some(ManagerCommand::Sync(reply)) => {
                            if absorb(&mut events) {
                                self.reconcile(&mut events, &mut shutdown).await;
                            }
                            let _ = reply.send(());
                        }
                        Some(ManagerCommand::Assets(reply)) => {
                            let _ = reply.send(self.assets.clone());
                        }
                        None => {
                            debug!("Asset manager handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        info!("Asset manager stopped");
    }

    async fn reconcile(
        &mut self,
        events: &mut broadcast::Receiver<StateChange>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        self.diff();
        self.drain(events, shutdown).await;
    }

    /// Stage pending changes from the desired `assets` tree and report them.
    fn diff(&mut self) {
        let desired = self.store.get(Scope::Desired, DESIRED_PREFIX);
        let Some(desired) = desired
            .as_ref()
            .and_then(|v| v.get("assets"))
            .and_then(Value::as_object)
        else {
            debug!("No desired asset map");
            return;
        };

        let mut added = Vec::new();
        let mut restored = Vec::new();
        for (id, entry) in desired {
            if !is_valid_id(id) {
                error!(asset_id = %id, "Ignoring desired asset with invalid id");
                continue;
            }
            let update_id = entry.get("updateId").and_then(update_id_of);

            if let Some(asset) = self.assets.iter_mut().find(|a| a.id() == id.as_str()) {
                if asset.update_id == update_id {
                    if asset.pending == Some(PendingChange::Remove) {
                        debug!(asset_id = %id, "Desired again, cancelling remove");
                        asset.clear_pending();
                        restored.push(id.as_str());
                    }
                } else if let Some(config) = parse_config(id, entry) {
                    asset.stage_deploy(update_id, config);
                }
                continue;
            }

            let Some(config) = parse_config(id, entry) else {
                continue;
            };
            let mut asset = Asset::new(config.kind(), id.clone());
            asset.stage_deploy(update_id, config);
            added.push(asset);
        }

        for asset in &mut self.assets {
            if !desired.contains_key(asset.id()) && asset.pending != Some(PendingChange::Remove) {
                asset.stage_remove();
            }
        }

        self.assets.extend(added);

        for asset in self.assets.iter() {
            if asset.pending.is_some() {
                debug!(asset_id = %asset.id(), state = asset.reported_label(), "Staged asset change");
            } else if !restored.contains(&asset.id()) {
                continue;
            }
            report(self.store.as_ref(), asset);
        }
    }

    async fn drain(
        &mut self,
        events: &mut broadcast::Receiver<StateChange>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            self.sweep();

            let Some(index) = self.assets.iter().position(|a| a.pending.is_some()) else {
                break;
            };
            self.process(index).await;
            self.persist().await;

            if !self.assets.iter().any(|a| a.pending.is_some()) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.step_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, leaving remaining asset changes pending");
                        return;
                    }
                }
            }

            if absorb(events) {
                self.diff();
            }
        }
    }

    /// Drop never-deployed assets whose removal is pending.
    fn sweep(&mut self) {
        let store = self.store.as_ref();
        self.assets.retain(|asset| {
            let drop = asset.pending == Some(PendingChange::Remove)
                && asset.state == AssetState::NotDeployed;
            if drop {
                debug!(asset_id = %asset.id(), "Dropping never-deployed asset");
                unreport(store, asset.id());
            }
            !drop
        });
    }

    async fn process(&mut self, index: usize) {
        let Some(change) = self.assets[index].pending.take() else {
            return;
        };

        let keep = match change {
            PendingChange::Deploy { update_id, config } => {
                self.process_deploy(index, update_id, config).await;
                true
            }
            PendingChange::Remove => self.process_remove(index).await,
        };

        if !keep {
            let asset = self.assets.remove(index);
            unreport(self.store.as_ref(), asset.id());
        }
    }

    async fn process_deploy(&mut self, index: usize, update_id: Option<String>, config: AssetConfig) {
        let store = self.store.as_ref();
        let ctx = &self.ctx;
        let asset = &mut self.assets[index];

        if asset.state == AssetState::Deployed {
            transition(store, asset, AssetState::Removing);
            if !asset.remove(ctx).await {
                transition(store, asset, AssetState::RemoveFail);
                return;
            }
        }

        asset.promote(update_id, config);
        transition(store, asset, AssetState::Deploying);
        let outcome = if asset.deploy(ctx).await {
            AssetState::Deployed
        } else {
            AssetState::DeployFail
        };
        transition(store, asset, outcome);
    }

    /// Returns whether the asset stays in the collection.
    async fn process_remove(&mut self, index: usize) -> bool {
        let store = self.store.as_ref();
        let ctx = &self.ctx;
        let asset = &mut self.assets[index];

        if asset.state == AssetState::NotDeployed {
            return false;
        }

        transition(store, asset, AssetState::Removing);
        if asset.remove(ctx).await {
            false
        } else {
            transition(store, asset, AssetState::RemoveFail);
            true
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.snapshot.save(&self.assets).await {
            error!(error = %e, "Failed to save asset snapshot");
        }
    }
}

fn is_relevant(change: &StateChange) -> bool {
    change.touches(Scope::Desired, DESIRED_PREFIX)
}

/// Ids become a key-path segment of the reported tree.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('.')
}

/// Drain buffered events. Returns whether any of them concerns assets.
fn absorb(events: &mut broadcast::Receiver<StateChange>) -> bool {
    let mut dirty = false;
    loop {
        match events.try_recv() {
            Ok(change) => dirty |= is_relevant(&change),
            Err(TryRecvError::Lagged(_)) => dirty = true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return dirty,
        }
    }
}

fn update_id_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_config(id: &str, entry: &Value) -> Option<AssetConfig> {
    let Some(raw) = entry.get("config") else {
        error!(asset_id = %id, "Desired asset has no config");
        return None;
    };
    match serde_json::from_value::<AssetConfig>(raw.clone()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!(asset_id = %id, error = %e, "Unsupported or invalid asset config");
            None
        }
    }
}

fn transition(store: &dyn DeviceStateStore, asset: &mut Asset, state: AssetState) {
    asset.set_state(state);
    info!(asset_id = %asset.id(), state = %state, "Asset state changed");
    report(store, asset);
}

fn report(store: &dyn DeviceStateStore, asset: &Asset) {
    let key = path::join(REPORTED_PREFIX, asset.id());
    if let Err(e) = store.update(
        Scope::Reported,
        UpdateOp::Set,
        &key,
        Some(asset.reported_value()),
    ) {
        error!(asset_id = %asset.id(), error = %e, "Failed to report asset state");
    }
}

fn unreport(store: &dyn DeviceStateStore, id: &str) {
    let key = path::join(REPORTED_PREFIX, id);
    if let Err(e) = store.update(Scope::Reported, UpdateOp::Remove, &key, None) {
        error!(asset_id = %id, error = %e, "Failed to clear reported asset state");
    }
}
