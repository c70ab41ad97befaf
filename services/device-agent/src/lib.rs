//! Fleet device agent library.
//!
//! The agent runs on each edge device and converges it on the backend's
//! desired state:
//!
//! ```text
//! DeviceStateStore ──changes──▶ AssetManager   (file assets on disk)
//!                  └─changes──▶ FlowFeed ──▶ ServiceController (flow runtime)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework used by the service supervisor
//! - `asset`: Asset model and the reconciliation worker
//! - `service`: Managed flow service supervision and flow deployment
//! - `transfer`: Streaming downloads, digests, and disk space checks

pub mod actors;
pub mod asset;
pub mod client;
pub mod config;
pub mod service;
pub mod transfer;

// Re-export commonly used types
pub use asset::{AssetManager, AssetManagerConfig, AssetManagerHandle, AssetState};
pub use client::BackendClient;
pub use service::{FlowFeed, ServiceConfig, ServiceController, ServiceHandle, ServiceStatus};
