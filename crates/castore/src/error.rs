//! Error taxonomy for storage gateway operations.

use thiserror::Error;

/// Errors a storage gateway can report.
///
/// The producer and consumer retry loops only look at [`StorageError::is_transient`];
/// everything else is treated as fatal by the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable or temporarily failing.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The writer is not allowed to modify this object.
    #[error("authorization denied for {uri}: {reason}")]
    AuthorizationDenied { uri: String, reason: String },

    /// Another update to the same document is in flight.
    #[error("conflicting update on {0}")]
    Conflict(String),

    /// Object does not exist (yet). Backends are eventually consistent, so a
    /// freshly written object may briefly read as missing.
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object uri: {0}")]
    InvalidUri(String),

    #[error("{acl} access policy not accepted by {operation}")]
    InvalidAcl {
        acl: &'static str,
        operation: &'static str,
    },

    #[error("gateway is read-only")]
    ReadOnly,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the operation may succeed if simply tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_)
                | StorageError::Conflict(_)
                | StorageError::NotFound(_)
                | StorageError::Io(_)
        )
    }
}
