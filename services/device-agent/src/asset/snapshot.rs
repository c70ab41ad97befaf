//! Durable asset bookkeeping.
//!
//! The snapshot is a JSON array of serialized assets. Only assets whose
//! state is worth remembering across restarts are written.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Asset, AssetConfig, AssetKind, AssetState};

/// On-disk form of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedAsset {
    #[serde(rename = "type")]
    kind: AssetKind,
    id: String,
    #[serde(default)]
    update_id: Option<String>,
    state: AssetState,
    #[serde(default)]
    change_ts: i64,
    #[serde(default)]
    config: Option<AssetConfig>,
}

impl From<&Asset> for SerializedAsset {
    fn from(asset: &Asset) -> Self {
        Self {
            kind: asset.kind(),
            id: asset.id().to_string(),
            update_id: asset.update_id.clone(),
            state: asset.state,
            change_ts: asset.change_ts,
            config: asset.config.clone(),
        }
    }
}

impl From<SerializedAsset> for Asset {
    fn from(s: SerializedAsset) -> Self {
        let mut asset = Asset::new(s.kind, s.id);
        asset.update_id = s.update_id;
        asset.config = s.config;
        asset.state = s.state;
        asset.change_ts = s.change_ts;
        asset
    }
}

/// Snapshot file manager.
#[derive(Debug, Clone)]
pub struct AssetSnapshot {
    path: PathBuf,
}

impl AssetSnapshot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load assets from disk.
    ///
    /// A missing file yields an empty list. Entries that cannot be decoded
    /// (unknown type, bad fields) are skipped. An unreadable or non-array
    /// file is an error.
    pub fn load(&self) -> Result<Vec<Asset>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No asset snapshot, starting fresh");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot: {}", self.path.display()))?;
        let entries: Vec<Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", self.path.display()))?;

        let mut assets = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<SerializedAsset>(entry) {
                Ok(serialized) => assets.push(Asset::from(serialized)),
                Err(e) => warn!(error = %e, "Skipping unreadable snapshot entry"),
            }
        }

        info!(
            path = %self.path.display(),
            asset_count = assets.len(),
            "Loaded asset snapshot"
        );
        Ok(assets)
    }

    /// Persist the assets whose state is recorded across restarts.
    ///
    /// Uses write-to-temp + rename.
    pub async fn save<'a>(&self, assets: impl IntoIterator<Item = &'a Asset>) -> Result<()> {
        let entries: Vec<SerializedAsset> = assets
            .into_iter()
            .filter(|a| a.state.is_persisted())
            .map(SerializedAsset::from)
            .collect();
        let content = serde_json::to_string(&entries).context("Failed to serialize assets")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "Failed to rename {} -> {}",
                    tmp_path.display(),
                    self.path.display()
                )
            })?;

        debug!(
            path = %self.path.display(),
            asset_count = entries.len(),
            "Saved asset snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::file_config;
    use serde_json::json;

    fn asset(id: &str, state: AssetState) -> Asset {
        let mut asset = Asset::new(AssetKind::File, id);
        asset.promote(Some(format!("{id}-u1")), file_config(id));
        asset.state = state;
        asset
    }

    #[tokio::test]
    async fn test_round_trip_keeps_persistable_states() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = AssetSnapshot::new(dir.path().join("asset-state.json"));

        let assets = vec![
            asset("a1", AssetState::Deployed),
            asset("a2", AssetState::DeployFail),
            asset("a3", AssetState::RemoveFail),
            asset("a4", AssetState::Deploying),
            asset("a5", AssetState::NotDeployed),
        ];
        snapshot.save(&assets).await.unwrap();

        let loaded = snapshot.load().unwrap();
        let summary: Vec<_> = loaded
            .iter()
            .map(|a| (a.id().to_string(), a.update_id.clone(), a.state))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a1".to_string(), Some("a1-u1".to_string()), AssetState::Deployed),
                ("a2".to_string(), Some("a2-u1".to_string()), AssetState::DeployFail),
                ("a3".to_string(), Some("a3-u1".to_string()), AssetState::RemoveFail),
            ]
        );
        assert_eq!(loaded[0].config, assets[0].config);
        assert_eq!(loaded[0].change_ts, assets[0].change_ts);
        assert!(loaded.iter().all(|a| a.pending.is_none()));
        assert!(!dir.path().join("asset-state.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = AssetSnapshot::new(dir.path().join("none.json"));
        assert!(snapshot.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset-state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(AssetSnapshot::new(path).load().is_err());
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset-state.json");
        let content = json!([
            {"type": "container", "id": "c1", "updateId": "u", "state": "deployed", "changeTs": 1},
            {"type": "file", "id": "f1", "updateId": "u", "state": "deployed", "changeTs": 2}
        ]);
        std::fs::write(&path, content.to_string()).unwrap();

        let loaded = AssetSnapshot::new(path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "f1");
    }

    #[test]
    fn test_wire_format() {
        let a = asset("a1", AssetState::Deployed);
        let value = serde_json::to_value(SerializedAsset::from(&a)).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["id"], "a1");
        assert_eq!(value["updateId"], "a1-u1");
        assert_eq!(value["state"], "deployed");
        assert_eq!(value["config"]["type"], "file");
        assert_eq!(value["config"]["fileTypeConfig"]["filename"], "a1");
        assert!(value["changeTs"].is_i64());
    }
}
