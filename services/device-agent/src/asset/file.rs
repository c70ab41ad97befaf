//! File asset variant.
//!
//! Downloads one file into the asset data directory, verifies its SHA-256
//! digest, sets its permissions, and optionally executes it.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{AssetContext, AssetError, AssetOps};
use crate::transfer::{available_space, sha256_base64};

const EXEC_MODE: u32 = 0o740;
const DATA_MODE: u32 = 0o640;

/// `config` payload of a `file` asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAssetConfig {
    /// Subdirectory of the asset data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_path: Option<String>,

    pub file_type_config: FileTypeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTypeConfig {
    pub filename: String,

    /// Declared size in bytes.
    pub size: u64,

    /// Base64 SHA-256 of the file.
    pub integrity: String,

    #[serde(default)]
    pub exec: bool,

    #[serde(default)]
    pub exec_config: ExecConfig,

    pub internal_src_config: InternalSrcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// Whitespace-separated arguments.
    #[serde(default)]
    pub args: String,

    /// `KEY=VALUE` entries.
    #[serde(default)]
    pub envs: Vec<String>,

    /// Hard timeout in seconds.
    #[serde(default = "default_max_time")]
    pub max_time: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            args: String::new(),
            envs: Vec::new(),
            max_time: default_max_time(),
        }
    }
}

fn default_max_time() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalSrcConfig {
    pub key: String,
}

/// Stage implementation for one file asset.
pub struct FileAsset<'a> {
    id: &'a str,
    config: &'a FileAssetConfig,
    ctx: &'a AssetContext,
}

impl<'a> FileAsset<'a> {
    pub fn new(id: &'a str, config: &'a FileAssetConfig, ctx: &'a AssetContext) -> Self {
        Self { id, config, ctx }
    }

    fn file_config(&self) -> &FileTypeConfig {
        &self.config.file_type_config
    }

    /// Directory the file is written to.
    pub fn dest_dir(&self) -> Result<PathBuf, AssetError> {
        match self.config.dest_path.as_deref() {
            None | Some("") => Ok(self.ctx.data_dir.clone()),
            Some(sub) => {
                if !is_contained(Path::new(sub)) {
                    return Err(AssetError::InvalidConfig(format!(
                        "destPath escapes the data directory: {sub}"
                    )));
                }
                Ok(self.ctx.data_dir.join(sub))
            }
        }
    }

    /// Full path of the installed file.
    pub fn file_path(&self) -> Result<PathBuf, AssetError> {
        let filename = &self.file_config().filename;
        let mut components = Path::new(filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dest_dir()?.join(filename)),
            _ => Err(AssetError::InvalidConfig(format!(
                "filename must be a single path component: {filename}"
            ))),
        }
    }
}

#[async_trait]
impl AssetOps for FileAsset<'_> {
    async fn acquire(&self) -> Result<(), AssetError> {
        let dest_dir = self.dest_dir()?;
        let path = self.file_path()?;
        tokio::fs::create_dir_all(&dest_dir).await?;

        let required = self.file_config().size;
        let available = available_space(&dest_dir)?;
        if available < required {
            return Err(AssetError::InsufficientSpace {
                available,
                required,
            });
        }

        let key = &self.file_config().internal_src_config.key;
        debug!(asset_id = %self.id, key = %key, "Resolving download URL");
        let url = self
            .ctx
            .resolver
            .resolve_download_url(key)
            .await
            .map_err(AssetError::Resolve)?;

        info!(asset_id = %self.id, dest = %path.display(), "Downloading asset file");
        self.ctx.downloader.download_to(&url, &path).await?;
        Ok(())
    }

    async fn verify(&self) -> Result<(), AssetError> {
        let path = self.file_path()?;
        let actual = sha256_base64(&path).await?;
        let expected = &self.file_config().integrity;
        if &actual != expected {
            return Err(AssetError::IntegrityMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        debug!(asset_id = %self.id, "Integrity verified");
        Ok(())
    }

    async fn install(&self) -> Result<(), AssetError> {
        let path = self.file_path()?;
        let mode = if self.file_config().exec {
            EXEC_MODE
        } else {
            DATA_MODE
        };
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn post_install(&self) -> Result<(), AssetError> {
        if !self.file_config().exec {
            return Ok(());
        }

        let path = self.file_path()?;
        let exec = &self.file_config().exec_config;
        let envs = parse_envs(self.id, &exec.envs);

        info!(asset_id = %self.id, path = %path.display(), "Executing asset file");
        let mut child = Command::new(&path)
            .args(exec.args.split_whitespace())
            .envs(envs)
            .current_dir(self.dest_dir()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(self.id.to_string(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(self.id.to_string(), stderr));
        }

        let status = match tokio::time::timeout(Duration::from_secs(exec.max_time), child.wait())
            .await
        {
            Ok(status) => status?,
            Err(_) => {
                warn!(asset_id = %self.id, max_time = exec.max_time, "Execution timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(asset_id = %self.id, error = %e, "Failed to kill timed out process");
                }
                return Err(AssetError::ExecTimeout(exec.max_time));
            }
        };

        if status.success() {
            info!(asset_id = %self.id, "Execution completed");
            Ok(())
        } else {
            Err(AssetError::ExecFailed(status.to_string()))
        }
    }

    async fn delete(&self) -> Result<(), AssetError> {
        let path = self.file_path()?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(asset_id = %self.id, path = %path.display(), "File already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `KEY=VALUE` entries. Malformed entries are skipped.
fn parse_envs(id: &str, raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
            _ => {
                warn!(asset_id = %id, entry = %entry, "Ignoring malformed env entry");
                None
            }
        })
        .collect()
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn forward_lines<R: AsyncRead + Unpin>(id: String, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "asset", asset_id = %id, "{line}");
    }
}
