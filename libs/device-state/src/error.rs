//! Error types for state store operations.

use thiserror::Error;

use crate::types::Scope;

/// Errors returned by a [`DeviceStateStore`](crate::DeviceStateStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A `set` was requested without a value.
    #[error("missing value for set of {scope}:{path}")]
    MissingValue { scope: Scope, path: String },

    /// The path contains an empty segment (`a..b`, trailing dot).
    #[error("invalid key path: {0:?}")]
    InvalidPath(String),
}
