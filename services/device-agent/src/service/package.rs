//! Flow package download and installation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use super::{EditSession, ServiceError};

pub const FLOWS_FILE: &str = "flows.json";
pub const CREDS_FILE: &str = "flows_cred.json";
pub const DEPS_PACKAGE: &str = "agent-dynamic-deps";

/// Flow package as served by the package locator.
///
/// Older packages use the singular `flow` / `cred` keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPackage {
    #[serde(default)]
    flow: Option<Value>,
    #[serde(default)]
    flows: Option<Value>,
    #[serde(default)]
    cred: Option<Value>,
    #[serde(default)]
    creds: Option<Value>,
    #[serde(default)]
    pub packages: Option<Value>,
    #[serde(default)]
    pub edit_session: Option<EditSession>,
}

impl FlowPackage {
    pub fn flows(&self) -> Option<&Value> {
        self.flow.as_ref().or(self.flows.as_ref())
    }

    pub fn creds(&self) -> Option<&Value> {
        self.cred.as_ref().or(self.creds.as_ref())
    }

    /// The edit session, if both of its fields are set.
    pub fn requested_edit_session(&self) -> Option<&EditSession> {
        self.edit_session.as_ref().filter(|s| s.is_requested())
    }

    /// File contents to write, relative to the data directory.
    fn parts(&self) -> Result<Vec<(PathBuf, Vec<u8>)>, ServiceError> {
        let mut parts = Vec::new();
        if let Some(flows) = self.flows() {
            parts.push((PathBuf::from(FLOWS_FILE), serde_json::to_vec(flows)?));
        }
        if let Some(creds) = self.creds() {
            parts.push((PathBuf::from(CREDS_FILE), serde_json::to_vec(creds)?));
        }
        if let Some(packages) = &self.packages {
            let manifest = json!({
                "name": DEPS_PACKAGE,
                "version": "0.0.1",
                "dependencies": packages,
            });
            parts.push((
                Path::new(DEPS_PACKAGE).join("package.json"),
                serde_json::to_vec_pretty(&manifest)?,
            ));
        }
        Ok(parts)
    }
}

/// GET the package at `url`.
pub async fn fetch_package(client: &Client, url: &str) -> Result<FlowPackage, ServiceError> {
    info!(url = %url, "Downloading flow package");
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ServiceError::PackageFetch {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.json().await?)
}

/// Write every present part under `data_dir`, concurrently.
pub async fn write_package(data_dir: &Path, package: &FlowPackage) -> Result<(), ServiceError> {
    let writes = package.parts()?.into_iter().map(|(rel, body)| {
        let path = data_dir.join(rel);
        async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(path = %path.display(), bytes = body.len(), "Writing flow package part");
            tokio::fs::write(&path, body).await?;
            Ok::<_, ServiceError>(())
        }
    });
    futures_util::future::try_join_all(writes).await?;
    Ok(())
}

/// Run the dependency resolver in `data_dir`. A non-zero exit is an error.
pub async fn install_dependencies(command: &str, data_dir: &Path) -> Result<(), ServiceError> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| ServiceError::InvalidCommand(command.to_string()))?;

    info!(command = %command, "Resolving flow dependencies");
    let status = Command::new(program)
        .args(parts)
        .current_dir(data_dir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|source| ServiceError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ServiceError::DependencyInstall(status.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_package_aliases() {
        let pkg: FlowPackage = serde_json::from_value(json!({
            "flows": [{"id": "n1"}],
            "cred": {"n1": {"user": "u"}},
        }))
        .unwrap();
        assert_eq!(pkg.flows(), Some(&json!([{"id": "n1"}])));
        assert_eq!(pkg.creds(), Some(&json!({"n1": {"user": "u"}})));
        assert!(pkg.packages.is_none());
        assert!(pkg.requested_edit_session().is_none());
    }

    #[test]
    fn test_partial_edit_session_is_ignored() {
        let pkg: FlowPackage = serde_json::from_value(json!({
            "flow": [],
            "editSession": {"ipAddress": "10.0.0.1"},
        }))
        .unwrap();
        assert!(pkg.edit_session.is_some());
        assert!(pkg.requested_edit_session().is_none());
    }

    #[tokio::test]
    async fn test_write_package_parts() {
        let dir = tempfile::tempdir().unwrap();
        let pkg: FlowPackage = serde_json::from_value(json!({
            "flow": [{"id": "n1"}],
            "creds": {"k": "v"},
            "packages": {"left-pad": "1.3.0"},
        }))
        .unwrap();

        write_package(dir.path(), &pkg).await.unwrap();

        let flows: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(FLOWS_FILE)).unwrap()).unwrap();
        assert_eq!(flows, json!([{"id": "n1"}]));
        let creds: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(CREDS_FILE)).unwrap()).unwrap();
        assert_eq!(creds, json!({"k": "v"}));
        let manifest: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(DEPS_PACKAGE).join("package.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            manifest,
            json!({
                "name": "agent-dynamic-deps",
                "version": "0.0.1",
                "dependencies": {"left-pad": "1.3.0"}
            })
        );
    }

    #[tokio::test]
    async fn test_write_package_skips_absent_parts() {
        let dir = tempfile::tempdir().unwrap();
        let pkg: FlowPackage = serde_json::from_value(json!({"flows": []})).unwrap();
        write_package(dir.path(), &pkg).await.unwrap();

        assert!(dir.path().join(FLOWS_FILE).exists());
        assert!(!dir.path().join(CREDS_FILE).exists());
        assert!(!dir.path().join(DEPS_PACKAGE).exists());
    }

    #[tokio::test]
    async fn test_fetch_package_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetch_package(&Client::new(), &format!("{}/pkg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PackageFetch { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_install_dependencies_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        install_dependencies("true", dir.path()).await.unwrap();

        let err = install_dependencies("false", dir.path()).await.unwrap_err();
        assert!(matches!(err, ServiceError::DependencyInstall(_)));

        let err = install_dependencies("   ", dir.path()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCommand(_)));
    }
}
