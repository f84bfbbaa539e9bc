//! Store error types

use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store's rules reject the operation at this path
    #[error("permission denied at /{0}")]
    PermissionDenied(String),

    /// The path contains a forbidden character or segment
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The store could not be reached or rejected the request
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A value at the path does not have the expected shape
    #[error("malformed record at /{path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Whether the error comes from store rules (misconfiguration) rather
    /// than a transient race
    pub fn is_permission(&self) -> bool {
        matches!(self, StoreError::PermissionDenied(_))
    }
}
