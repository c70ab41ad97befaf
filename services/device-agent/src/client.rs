//! Management backend API client.
//!
//! Provides methods for communicating with the backend:
//! - Resolving download URLs for internally hosted file assets
//! - Posting agent status notifications

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::asset::AssetDataResolver;
use crate::config::Config;

/// Management backend client.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssetDataUrlRequest<'a> {
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct AssetDataUrlResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct NotifyStatusRequest<'a> {
    status: &'a str,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.backend_url.clone(), config.access_token.clone())
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}/{}", self.base_url, path));
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Exchange an internal asset key for a short-lived download URL.
    pub async fn resolve_download_url(&self, key: &str) -> Result<String> {
        debug!(key = %key, "Resolving asset download URL");
        let response = self
            .post("internal-file-asset-data-url")
            .json(&AssetDataUrlRequest { key })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to resolve asset download URL");
            anyhow::bail!("Failed to resolve asset download URL: {} - {}", status, body);
        }

        let payload: AssetDataUrlResponse = response.json().await?;
        Ok(payload.url)
    }

    /// Post an agent status notification.
    pub async fn notify_status(&self, status: &str) -> Result<()> {
        debug!(status = %status, "Notifying status");
        let response = self
            .post("notify-status")
            .json(&NotifyStatusRequest { status })
            .send()
            .await?;

        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to notify status");
            anyhow::bail!("Failed to notify status: {} - {}", status_code, body);
        }

        Ok(())
    }
}

#[async_trait]
impl AssetDataResolver for BackendClient {
    async fn resolve_download_url(&self, key: &str) -> Result<String> {
        BackendClient::resolve_download_url(self, key).await
    }
}
