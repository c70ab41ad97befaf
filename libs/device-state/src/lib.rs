//! # fleet-device-state
//!
//! The desired/reported state contract consumed by the device agent.
//!
//! ## Model
//!
//! The backend declares a *desired* document and the agent publishes a
//! *reported* document. Both are JSON trees addressed by dot-separated key
//! paths (`assets.assets.a1`). The store emits a [`StateChange`] for every
//! mutation so components can react to the parts of the tree they own.
//!
//! ## Contract
//!
//! - `get(scope, path)` returns a clone of the value at `path`
//! - `update(scope, op, path, value)` sets or removes a value
//! - `subscribe()` yields changes in the order the store applied them
//!
//! [`MemoryStateStore`] is the in-process implementation used by the agent
//! binary and by tests.

mod error;
mod memory;
pub mod path;
mod types;

pub use error::StateError;
pub use memory::MemoryStateStore;
pub use types::{DeviceStateStore, Scope, StateChange, UpdateOp};
