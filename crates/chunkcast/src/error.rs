//! Error taxonomy shared by the producer and consumer sides.

use std::fmt;
use std::sync::Arc;

use castore::StorageError;
use thiserror::Error;

use crate::consumer::sink::SinkError;
use crate::manifest::ManifestError;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Transient storage failure. Retried with backoff by the owning component.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The store refused the request for a reason retrying cannot fix.
    #[error("storage rejected request: {0}")]
    StorageRejected(String),

    #[error("manifest invariant violated: {0}")]
    ManifestInvariantViolation(#[from] ManifestError),

    #[error("manifest is not valid JSON: {0}")]
    ManifestCodec(#[from] serde_json::Error),

    #[error("decoder sink buffer is full")]
    SinkCapacityExceeded,

    #[error("decoder sink is not accepting appends")]
    SinkInvalidState,

    #[error("decoder sink failed: {0}")]
    Sink(String),

    /// Fetched bytes do not match the content address. Re-fetched.
    #[error("segment content does not match {0}")]
    CorruptSegment(String),

    #[error("segment {index} lost after {attempts} fetch attempts")]
    SegmentLost { index: u64, attempts: u32 },

    #[error("clock error: {0}")]
    Clock(String),

    #[error("invalid identity: {0}")]
    Identity(String),

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    #[error("capture read failed: {0}")]
    Capture(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session closed")]
    SessionClosed,
}

impl StreamError {
    /// Whether the owning component should retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::StorageUnavailable(_)
                | StreamError::CorruptSegment(_)
                | StreamError::SinkCapacityExceeded
                | StreamError::SinkInvalidState
        )
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, StreamError::AuthorizationDenied(_))
    }

    pub(crate) fn invalid_transition(operation: &'static str, state: impl fmt::Display) -> Self {
        StreamError::InvalidTransition {
            operation,
            state: state.to_string(),
        }
    }
}

impl From<StorageError> for StreamError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AuthorizationDenied { .. } | StorageError::ReadOnly => {
                StreamError::AuthorizationDenied(err.to_string())
            }
            err if err.is_transient() => StreamError::StorageUnavailable(err.to_string()),
            err => StreamError::StorageRejected(err.to_string()),
        }
    }
}

impl From<SinkError> for StreamError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::CapacityExceeded => StreamError::SinkCapacityExceeded,
            SinkError::InvalidState => StreamError::SinkInvalidState,
            SinkError::Failed(message) => StreamError::Sink(message),
        }
    }
}

/// The part of a session that hit a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    ProducerSession,
    UploadSequencer,
    ManifestPoller,
    SegmentFeeder,
    PlaybackSession,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::ProducerSession => "producer session",
            Component::UploadSequencer => "upload sequencer",
            Component::ManifestPoller => "manifest poller",
            Component::SegmentFeeder => "segment feeder",
            Component::PlaybackSession => "playback session",
        };
        f.write_str(name)
    }
}

/// A fatal error, reported with enough context to resume or restart.
///
/// `last_index` is the last segment index committed (producer) or applied
/// (consumer) before the failure.
#[derive(Debug, Clone, Error)]
#[error("{component} failed after {}: {error}", describe_index(.last_index))]
pub struct SessionFailure {
    pub component: Component,
    pub last_index: Option<u64>,
    #[source]
    pub error: Arc<StreamError>,
}

impl SessionFailure {
    pub fn new(component: Component, last_index: Option<u64>, error: StreamError) -> Self {
        Self {
            component,
            last_index,
            error: Arc::new(error),
        }
    }
}

fn describe_index(index: &Option<u64>) -> String {
    match index {
        Some(index) => format!("segment {index}"),
        None => "no segments".to_string(),
    }
}
