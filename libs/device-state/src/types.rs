//! Core contract types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StateError;
use crate::path;

/// Which document a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Backend-declared target configuration.
    Desired,
    /// Agent-observed configuration.
    Reported,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Desired => write!(f, "desired"),
            Scope::Reported => write!(f, "reported"),
        }
    }
}

/// Mutation applied by [`DeviceStateStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    Set,
    Remove,
}

/// Notification emitted after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Document that changed.
    #[serde(rename = "type")]
    pub scope: Scope,
    /// Path that was written (`""` for the whole document).
    pub path: String,
}

impl StateChange {
    pub fn new(scope: Scope, path: impl Into<String>) -> Self {
        Self {
            scope,
            path: path.into(),
        }
    }

    /// Whether this change may affect the subtree rooted at `prefix`.
    ///
    /// A change to an ancestor (including the root) affects every
    /// descendant, so both directions match.
    pub fn touches(&self, scope: Scope, prefix: &str) -> bool {
        self.scope == scope
            && (path::is_within(&self.path, prefix) || path::is_within(prefix, &self.path))
    }
}

/// Key-path state store shared by the agent components.
pub trait DeviceStateStore: Send + Sync {
    /// Read a clone of the value at `path`, or `None` if absent.
    fn get(&self, scope: Scope, path: &str) -> Option<Value>;

    /// Set or remove the value at `path` and notify subscribers.
    fn update(
        &self,
        scope: Scope,
        op: UpdateOp,
        path: &str,
        value: Option<Value>,
    ) -> Result<(), StateError>;

    /// Subscribe to future changes.
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}
