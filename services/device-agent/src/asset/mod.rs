//! Deployable assets.
//!
//! An [`Asset`] is one entry of the desired `assets.assets` map. Its payload
//! is an [`AssetConfig`] variant; each variant exposes the [`AssetOps`]
//! stages that [`Asset::deploy`] and [`Asset::remove`] drive.
//!
//! ## State machine
//!
//! ```text
//! notDeployed ──deploy──▶ deploying ──▶ deployed | deployFail
//! deployed ──remove──▶ removing ──▶ (dropped) | removeFail
//! ```
//!
//! Only the drain loop in [`manager`] mutates `state`. Diffing only stages a
//! [`PendingChange`].

mod file;
pub mod manager;
mod snapshot;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::transfer::{Downloader, TransferError};

pub use file::{ExecConfig, FileAsset, FileAssetConfig, FileTypeConfig, InternalSrcConfig};
pub use manager::{AssetManager, AssetManagerConfig, AssetManagerHandle};
pub use snapshot::AssetSnapshot;

/// Errors from asset stages.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Insufficient space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Failed to resolve download URL: {0}")]
    Resolve(#[source] anyhow::Error),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Post-install command failed: {0}")]
    ExecFailed(String),

    #[error("Post-install command exceeded {0}s")]
    ExecTimeout(u64),

    #[error("Invalid asset config: {0}")]
    InvalidConfig(String),
}

/// Resolves an asset data key to a short-lived download URL.
#[async_trait]
pub trait AssetDataResolver: Send + Sync {
    async fn resolve_download_url(&self, key: &str) -> anyhow::Result<String>;
}

/// Shared collaborators for asset stages.
#[derive(Clone)]
pub struct AssetContext {
    /// Root directory assets are installed under.
    pub data_dir: PathBuf,
    pub resolver: Arc<dyn AssetDataResolver>,
    pub downloader: Downloader,
}

/// Deployment stages of one asset variant. The first failing stage aborts.
#[async_trait]
pub trait AssetOps: Send + Sync {
    /// Fetch the artifact to its destination.
    async fn acquire(&self) -> Result<(), AssetError>;

    /// Check the fetched artifact.
    async fn verify(&self) -> Result<(), AssetError>;

    /// Make the artifact usable in place.
    async fn install(&self) -> Result<(), AssetError>;

    /// Run follow-up hooks.
    async fn post_install(&self) -> Result<(), AssetError>;

    /// Delete the installed artifact. Already absent is success.
    async fn delete(&self) -> Result<(), AssetError>;
}

/// Asset kind, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    File,
}

/// Variant configuration, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetConfig {
    File(FileAssetConfig),
}

impl AssetConfig {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetConfig::File(_) => AssetKind::File,
        }
    }

    /// Stage table for this variant.
    pub fn ops<'a>(&'a self, id: &'a str, ctx: &'a AssetContext) -> Box<dyn AssetOps + 'a> {
        match self {
            AssetConfig::File(config) => Box::new(FileAsset::new(id, config, ctx)),
        }
    }
}

/// Lifecycle state of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetState {
    NotDeployed,
    Deploying,
    Deployed,
    DeployFail,
    Removing,
    RemoveFail,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::NotDeployed => "notDeployed",
            AssetState::Deploying => "deploying",
            AssetState::Deployed => "deployed",
            AssetState::DeployFail => "deployFail",
            AssetState::Removing => "removing",
            AssetState::RemoveFail => "removeFail",
        }
    }

    /// Whether the snapshot file records assets in this state.
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            AssetState::Deployed | AssetState::DeployFail | AssetState::RemoveFail
        )
    }
}

impl std::fmt::Display for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change staged by a diff, applied by the drain loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange {
    /// Deploy `config` as version `update_id`.
    Deploy {
        update_id: Option<String>,
        config: AssetConfig,
    },
    Remove,
}

/// One managed asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    kind: AssetKind,
    id: String,

    /// Version of the applied config. `None` until the first deploy begins.
    pub update_id: Option<String>,

    /// Applied config. `None` until the first deploy begins.
    pub config: Option<AssetConfig>,

    pub state: AssetState,
    pub pending: Option<PendingChange>,

    /// Milliseconds since the Unix epoch of the last state or pending change.
    pub change_ts: i64,
}

impl Asset {
    /// A never-deployed asset with nothing staged.
    pub fn new(kind: AssetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            update_id: None,
            config: None,
            state: AssetState::NotDeployed,
            pending: None,
            change_ts: now_ms(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    /// Stage a deploy, replacing whatever was staged before.
    pub fn stage_deploy(&mut self, update_id: Option<String>, config: AssetConfig) {
        self.pending = Some(PendingChange::Deploy { update_id, config });
        self.touch();
    }

    pub fn stage_remove(&mut self) {
        self.pending = Some(PendingChange::Remove);
        self.touch();
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
        self.touch();
    }

    pub fn set_state(&mut self, state: AssetState) {
        self.state = state;
        self.touch();
    }

    /// Make a staged config current.
    pub fn promote(&mut self, update_id: Option<String>, config: AssetConfig) {
        self.update_id = update_id;
        self.kind = config.kind();
        self.config = Some(config);
    }

    /// Label published in reported state. Pending changes take precedence.
    pub fn reported_label(&self) -> &'static str {
        match &self.pending {
            Some(PendingChange::Deploy { .. }) => "deployPending",
            Some(PendingChange::Remove) => "removePending",
            None => self.state.as_str(),
        }
    }

    /// Reported entry `{updateId, ts, state}`.
    pub fn reported_value(&self) -> serde_json::Value {
        serde_json::json!({
            "updateId": self.update_id,
            "ts": self.change_ts,
            "state": self.reported_label(),
        })
    }

    /// Run every stage of the current config. Failures are logged.
    pub async fn deploy(&self, ctx: &AssetContext) -> bool {
        let Some(config) = &self.config else {
            error!(asset_id = %self.id, "Deploy requested without a config");
            return false;
        };

        info!(asset_id = %self.id, update_id = ?self.update_id, "Deploying asset");
        let ops = config.ops(&self.id, ctx);
        let result = async {
            ops.acquire().await?;
            ops.verify().await?;
            ops.install().await?;
            ops.post_install().await
        }
        .await;

        match result {
            Ok(()) => {
                info!(asset_id = %self.id, "Asset deployed");
                true
            }
            Err(e) => {
                error!(asset_id = %self.id, error = %e, "Asset deploy failed");
                false
            }
        }
    }

    /// Delete the installed artifact. Failures are logged.
    pub async fn remove(&self, ctx: &AssetContext) -> bool {
        let Some(config) = &self.config else {
            return true;
        };

        info!(asset_id = %self.id, "Removing asset");
        match config.ops(&self.id, ctx).delete().await {
            Ok(()) => {
                info!(asset_id = %self.id, "Asset removed");
                true
            }
            Err(e) => {
                error!(asset_id = %self.id, error = %e, "Asset remove failed");
                false
            }
        }
    }

    fn touch(&mut self) {
        self.change_ts = now_ms();
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn file_config(filename: &str) -> AssetConfig {
        serde_json::from_value(json!({
            "type": "file",
            "fileTypeConfig": {
                "filename": filename,
                "size": 5,
                "integrity": "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=",
                "internalSrcConfig": {"key": "k1"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_reported_label_prefers_pending() {
        let mut asset = Asset::new(AssetKind::File, "a1");
        assert_eq!(asset.reported_label(), "notDeployed");

        asset.stage_deploy(Some("u1".into()), file_config("f"));
        assert_eq!(asset.reported_label(), "deployPending");

        asset.stage_remove();
        assert_eq!(asset.reported_label(), "removePending");

        asset.pending = None;
        asset.set_state(AssetState::RemoveFail);
        assert_eq!(asset.reported_label(), "removeFail");
    }

    #[test]
    fn test_latest_staged_deploy_wins() {
        let mut asset = Asset::new(AssetKind::File, "a1");
        asset.stage_deploy(Some("u1".into()), file_config("one"));
        asset.stage_deploy(Some("u2".into()), file_config("two"));

        match asset.pending {
            Some(PendingChange::Deploy { update_id, config }) => {
                assert_eq!(update_id.as_deref(), Some("u2"));
                assert_eq!(config, file_config("two"));
            }
            other => panic!("unexpected pending change: {other:?}"),
        }
    }

    #[test]
    fn test_reported_value_shape() {
        let mut asset = Asset::new(AssetKind::File, "a1");
        asset.promote(Some("u1".into()), file_config("f"));
        asset.set_state(AssetState::Deployed);

        let value = asset.reported_value();
        assert_eq!(value["updateId"], "u1");
        assert_eq!(value["state"], "deployed");
        assert_eq!(value["ts"], asset.change_ts);
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(
            serde_json::to_value(AssetState::DeployFail).unwrap(),
            json!("deployFail")
        );
        assert_eq!(
            serde_json::from_value::<AssetState>(json!("notDeployed")).unwrap(),
            AssetState::NotDeployed
        );
        assert!(AssetState::RemoveFail.is_persisted());
        assert!(!AssetState::Deploying.is_persisted());
    }

    #[test]
    fn test_unknown_config_type_is_rejected() {
        let result = serde_json::from_value::<AssetConfig>(json!({"type": "container"}));
        assert!(result.is_err());
    }
}
