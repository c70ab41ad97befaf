//! Flow package deployment through the service controller and flow feed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleet_device_agent::service::{ServiceError, ServicePhase};
use fleet_device_agent::{FlowFeed, ServiceConfig, ServiceController, ServiceHandle};
use fleet_device_state::{DeviceStateStore, MemoryStateStore, Scope, UpdateOp};
use serde_json::{json, Value};
use tokio::sync::watch;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service_config(dir: &Path) -> ServiceConfig {
    let service_dir = dir.join("service");
    let data_dir = service_dir.join(".flow-data");
    std::fs::create_dir_all(&data_dir).unwrap();
    ServiceConfig {
        dir: service_dir,
        data_dir,
        command: "sleep 30".to_string(),
        pid_file: dir.join("service.pid"),
        assets_data_path: dir.join("assets"),
        dependency_command: "true".to_string(),
        startup_grace: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        ..ServiceConfig::default()
    }
}

fn data_file(config: &ServiceConfig, name: &str) -> PathBuf {
    config.data_dir.join(name)
}

async fn package_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flows": [{"id": "n1", "type": "inject"}],
            "creds": {"n1": {"token": "t"}},
            "packages": {"node-red-contrib-x": "1.0.0"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg/edit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flows": [],
            "editSession": {"ipAddress": "127.0.0.1", "sessionToken": "s"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    server
}

fn spawn_service(config: ServiceConfig) -> (ServiceHandle, watch::Sender<bool>) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (handle, _task) = ServiceController::new(config).unwrap().spawn(shutdown_rx);
    (handle, shutdown)
}

async fn wait_for_flow(store: &MemoryStateStore, update_id: &str, state: &str) {
    let expected = (Some(json!(update_id)), Some(json!(state)));
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let reported = (
                store.get(Scope::Reported, "flow.updateId"),
                store.get(Scope::Reported, "flow.state"),
            );
            if reported == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_deploy_flow_writes_package_and_runs_service() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let config = service_config(dir.path());
    let (handle, _shutdown) = spawn_service(config.clone());

    handle
        .deploy_flow(format!("{}/pkg/1", server.uri()))
        .await
        .unwrap();

    let flows: Value =
        serde_json::from_slice(&std::fs::read(data_file(&config, "flows.json")).unwrap()).unwrap();
    assert_eq!(flows, json!([{"id": "n1", "type": "inject"}]));
    assert!(data_file(&config, "flows_cred.json").exists());
    assert!(data_file(&config, "agent-dynamic-deps/package.json").exists());

    let status = handle.status().await.unwrap();
    assert_eq!(status.phase, ServicePhase::Running);
    assert!(!status.editor_mode);
    assert!(config.pid_file.exists());
}

#[tokio::test]
async fn test_missing_package_writes_nothing_and_keeps_service() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let config = service_config(dir.path());
    let (handle, _shutdown) = spawn_service(config.clone());

    handle.start(None).await.unwrap();
    let before = handle.status().await.unwrap();

    let err = handle
        .deploy_flow(format!("{}/pkg/missing", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PackageFetch { status: 404, .. }));

    assert!(!data_file(&config, "flows.json").exists());
    let after = handle.status().await.unwrap();
    assert_eq!(after.phase, ServicePhase::Running);
    assert_eq!(after.pid, before.pid);
}

#[tokio::test]
async fn test_edit_session_refused_when_not_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let config = service_config(dir.path());
    let (handle, _shutdown) = spawn_service(config.clone());

    let err = handle
        .deploy_flow(format!("{}/pkg/edit", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::EditSessionNotAllowed));

    assert!(!data_file(&config, "flows.json").exists());
    assert_eq!(handle.status().await.unwrap().phase, ServicePhase::Stopped);
}

#[tokio::test]
async fn test_edit_session_starts_editor_mode() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let mut config = service_config(dir.path());
    config.allow_edit_sessions = true;
    config.editor_args = vec!["30".to_string()];
    let (handle, _shutdown) = spawn_service(config.clone());

    handle
        .deploy_flow(format!("{}/pkg/edit", server.uri()))
        .await
        .unwrap();

    assert!(data_file(&config, "flows.json").exists());
    let status = handle.status().await.unwrap();
    assert_eq!(status.phase, ServicePhase::Running);
    assert!(status.editor_mode);
}

#[tokio::test]
async fn test_editor_pinged_once_flows_start() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let editor = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/agent-editor/ping"))
        .and(header("x-ee-session", "s"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&editor)
        .await;

    let mut config = service_config(dir.path());
    std::fs::write(
        config.dir.join("editor.sh"),
        "echo 'Starting'\necho 'Started flows'\necho 'Started flows'\nsleep 30\n",
    )
    .unwrap();
    config.allow_edit_sessions = true;
    config.command = "sh".to_string();
    config.editor_args = vec!["editor.sh".to_string()];
    config.editor_port = editor.address().port();
    let (handle, _shutdown) = spawn_service(config);

    handle
        .deploy_flow(format!("{}/pkg/edit", server.uri()))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while editor.received_requests().await.unwrap_or_default().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    editor.verify().await;
}

#[tokio::test]
async fn test_flow_feed_reports_refused_edit_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let config = service_config(dir.path());
    let (handle, shutdown) = spawn_service(config.clone());

    let store = Arc::new(MemoryStateStore::new());
    let feed = FlowFeed::new(store.clone(), handle.clone()).spawn(shutdown.subscribe());
    store
        .update(
            Scope::Desired,
            UpdateOp::Set,
            "flow",
            Some(json!({"updateId": "e1", "downloadUrl": format!("{}/pkg/edit", server.uri())})),
        )
        .unwrap();

    wait_for_flow(&store, "e1", "deployFail").await;
    assert!(!data_file(&config, "flows.json").exists());
    assert_eq!(handle.status().await.unwrap().phase, ServicePhase::Stopped);

    shutdown.send(true).unwrap();
    feed.await.unwrap();
}

#[tokio::test]
async fn test_flow_feed_reports_deployments() {
    let dir = tempfile::tempdir().unwrap();
    let server = package_server().await;
    let config = service_config(dir.path());
    let (handle, shutdown) = spawn_service(config.clone());

    let first_url = format!("{}/pkg/1", server.uri());
    let missing_url = format!("{}/pkg/missing", server.uri());
    let store = Arc::new(MemoryStateStore::new());
    let feed = FlowFeed::new(store.clone(), handle.clone()).spawn(shutdown.subscribe());

    store
        .update(
            Scope::Desired,
            UpdateOp::Set,
            "flow",
            Some(json!({"updateId": "u1", "downloadUrl": first_url})),
        )
        .unwrap();
    wait_for_flow(&store, "u1", "deployed").await;
    let first = handle.status().await.unwrap();
    assert_eq!(first.phase, ServicePhase::Running);

    // A failed fetch is reported and leaves the running flow alone.
    store
        .update(
            Scope::Desired,
            UpdateOp::Set,
            "flow",
            Some(json!({"updateId": "u2", "downloadUrl": missing_url})),
        )
        .unwrap();
    wait_for_flow(&store, "u2", "deployFail").await;
    assert_eq!(handle.status().await.unwrap().pid, first.pid);

    shutdown.send(true).unwrap();
    feed.await.unwrap();
}
