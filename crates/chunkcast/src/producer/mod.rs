//! Broadcast side: segment capture, single-flight upload sequencing and the
//! producer session lifecycle.

pub mod segmenter;
pub(crate) mod sequencer;
pub mod session;

use std::fmt;
use std::time::Duration;

use castore::{Acl, ObjectUri, StorageGateway, WriterAuth};
use tracing::info;

use crate::error::{SessionFailure, StreamError};
use crate::manifest::Manifest;

pub use segmenter::Segmenter;
pub use session::ProducerSession;

/// Producer lifecycle.
///
/// `Idle → Initialized → Recording → Draining → Ended`, with `Failed`
/// reachable from `Initialized` and `Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Initialized,
    Recording,
    Draining,
    Ended,
    Failed,
}

impl ProducerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProducerState::Ended | ProducerState::Failed)
    }
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerState::Idle => "idle",
            ProducerState::Initialized => "initialized",
            ProducerState::Recording => "recording",
            ProducerState::Draining => "draining",
            ProducerState::Ended => "ended",
            ProducerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a finalize, repeated verbatim by later calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Segments in the final manifest.
    pub committed: u64,
    /// Capture indices that never made it into the manifest.
    pub abandoned: Vec<u64>,
}

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    SegmentCommitted {
        index: u64,
        uri: ObjectUri,
    },
    UploadRetrying {
        index: u64,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A retry round ran out of attempts. The segment stays queued.
    UploadStalled {
        index: u64,
        attempts: u32,
        error: String,
    },
    Abandoned {
        indices: Vec<u64>,
    },
    Finalized(FinalizeReport),
    Failed(SessionFailure),
}

/// Handle to an initialized stream: where the manifest lives and who may
/// write it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    manifest_uri: ObjectUri,
    auth: WriterAuth,
}

impl StreamHandle {
    pub fn manifest_uri(&self) -> &ObjectUri {
        &self.manifest_uri
    }

    pub fn auth(&self) -> &WriterAuth {
        &self.auth
    }
}

/// Store a fresh manifest under a writer-only ACL owned by its creator.
///
/// `auth` must carry the creator's identity; anything else is refused before
/// touching storage.
pub async fn initialize_session(
    gateway: &dyn StorageGateway,
    manifest: &Manifest,
    auth: WriterAuth,
) -> Result<StreamHandle, StreamError> {
    if !auth.authorizes(&manifest.creator) {
        return Err(StreamError::AuthorizationDenied(format!(
            "{} cannot publish a stream created by {}",
            auth.identity(),
            manifest.creator
        )));
    }
    manifest.validate()?;

    let manifest_uri = gateway
        .put_mutable(manifest.to_bytes()?, Acl::WriterOnly(manifest.creator.clone()))
        .await?;

    info!(
        stream.uri = %manifest_uri,
        stream.creator = %manifest.creator,
        "📡 stream manifest published"
    );

    Ok(StreamHandle { manifest_uri, auth })
}
