//! In-memory state store.

use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StateError;
use crate::path;
use crate::types::{DeviceStateStore, Scope, StateChange, UpdateOp};

/// Default capacity of the change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Documents {
    desired: Value,
    reported: Value,
}

impl Documents {
    fn doc(&self, scope: Scope) -> &Value {
        match scope {
            Scope::Desired => &self.desired,
            Scope::Reported => &self.reported,
        }
    }

    fn doc_mut(&mut self, scope: Scope) -> &mut Value {
        match scope {
            Scope::Desired => &mut self.desired,
            Scope::Reported => &mut self.reported,
        }
    }
}

/// Thread-safe in-memory desired/reported store.
///
/// Changes are broadcast after the mutation is applied and while the
/// document lock is held, so subscribers observe changes in store order.
pub struct MemoryStateStore {
    docs: Mutex<Documents>,
    changes: broadcast::Sender<StateChange>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_capacity(CHANGE_CHANNEL_CAPACITY)
    }

    /// Create an empty store whose change channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            docs: Mutex::new(Documents {
                desired: Value::Object(Map::new()),
                reported: Value::Object(Map::new()),
            }),
            changes,
        }
    }

    /// Clone of a whole document.
    pub fn snapshot(&self, scope: Scope) -> Value {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.doc(scope).clone()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateStore for MemoryStateStore {
    fn get(&self, scope: Scope, path: &str) -> Option<Value> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        path::lookup(docs.doc(scope), path).cloned()
    }

    fn update(
        &self,
        scope: Scope,
        op: UpdateOp,
        path: &str,
        value: Option<Value>,
    ) -> Result<(), StateError> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = docs.doc_mut(scope);

        let changed = match op {
            UpdateOp::Set => {
                let value = value.ok_or_else(|| StateError::MissingValue {
                    scope,
                    path: path.to_string(),
                })?;
                path::assign(doc, path, value)?;
                true
            }
            UpdateOp::Remove => path::take(doc, path)?.is_some(),
        };

        if changed {
            debug!(scope = %scope, path = %path, op = ?op, "State updated");
            // No receivers is fine; nobody is listening yet.
            let _ = self.changes.send(StateChange::new(scope, path));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_notify() {
        let store = MemoryStateStore::new();
        let mut rx = store.subscribe();

        store
            .update(
                Scope::Desired,
                UpdateOp::Set,
                "assets",
                Some(json!({"assets": {}})),
            )
            .unwrap();

        assert_eq!(
            store.get(Scope::Desired, "assets"),
            Some(json!({"assets": {}}))
        );
        assert_eq!(store.get(Scope::Reported, "assets"), None);

        let change = rx.recv().await.unwrap();
        assert_eq!(change, StateChange::new(Scope::Desired, "assets"));
    }

    #[tokio::test]
    async fn test_remove_missing_path_emits_nothing() {
        let store = MemoryStateStore::new();
        let mut rx = store.subscribe();

        store
            .update(Scope::Reported, UpdateOp::Remove, "assets.assets.a1", None)
            .unwrap();
        assert!(rx.try_recv().is_err());

        store
            .update(Scope::Reported, UpdateOp::Set, "assets.assets.a1", Some(json!(1)))
            .unwrap();
        store
            .update(Scope::Reported, UpdateOp::Remove, "assets.assets.a1", None)
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().path, "assets.assets.a1");
        assert_eq!(rx.recv().await.unwrap().path, "assets.assets.a1");
        assert_eq!(store.snapshot(Scope::Reported), json!({"assets": {"assets": {}}}));
    }

    #[test]
    fn test_set_without_value_is_rejected() {
        let store = MemoryStateStore::new();
        let err = store
            .update(Scope::Desired, UpdateOp::Set, "flow", None)
            .unwrap_err();
        assert_eq!(
            err,
            StateError::MissingValue {
                scope: Scope::Desired,
                path: "flow".to_string()
            }
        );
    }
}
