//! Fleet device agent
//!
//! Keeps an edge device's file assets and managed flow service in line with
//! the desired state published by the management backend.
//!
//! ## Architecture
//!
//! - **Asset Manager**: Deploys, updates, and removes file assets
//! - **Service Controller**: Supervises the flow runtime process
//! - **Flow Feed**: Turns desired flow changes into service deployments

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_device_agent::config::Config;
use fleet_device_agent::{AssetManager, BackendClient, FlowFeed, ServiceController};
use fleet_device_state::{DeviceStateStore, MemoryStateStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet device agent");
    info!(
        data_dir = %config.data_dir.display(),
        backend_url = %config.backend_url,
        service_dir = %config.service_dir.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store: Arc<dyn DeviceStateStore> = Arc::new(MemoryStateStore::new());
    let backend = Arc::new(BackendClient::from_config(&config)?);

    // Asset manager
    let mut assets = AssetManager::new(
        config.asset_manager_config(),
        Arc::clone(&store),
        backend.clone(),
    )?;
    assets.setup()?;
    let (_assets_handle, assets_task) = assets.spawn(shutdown_rx.clone());

    // Managed flow service
    let service = ServiceController::new(config.service_config()?)
        .context("Failed to create service controller")?;
    let (service_handle, service_task) = service.spawn(shutdown_rx.clone());
    if let Err(e) = service_handle.start(None).await {
        error!(error = %e, "Failed to start service");
    }

    let feed_task = FlowFeed::new(Arc::clone(&store), service_handle.clone()).spawn(shutdown_rx);

    if let Err(e) = backend.notify_status("online").await {
        warn!(error = %e, "Failed to notify backend");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for (name, task) in [
        ("asset manager", assets_task),
        ("service controller", service_task),
        ("flow feed", feed_task),
    ] {
        if let Err(e) = task.await {
            error!(worker = name, error = %e, "Worker task panicked");
        }
    }

    info!("Device agent shutdown complete");
    Ok(())
}
