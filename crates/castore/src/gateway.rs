//! The storage gateway contract consumed by producers and consumers.

use async_trait::async_trait;
use bytes::Bytes;

use crate::acl::{Acl, WriterAuth};
use crate::error::StorageError;
use crate::uri::ObjectUri;

/// Trait for storage backends.
///
/// Implementations are free to be eventually consistent: a `get` issued right
/// after a `put` or `update_mutable` may return stale bytes or `NotFound`.
/// None of the operations offer push notification; readers poll.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Store write-once content. `acl` must be [`Acl::ImmutablePublic`].
    ///
    /// Content-addressed: storing the same bytes twice returns the same URI.
    async fn put(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError>;

    /// Create a mutable document. `acl` must be [`Acl::WriterOnly`]; the
    /// named identity becomes the only writer allowed to update it.
    async fn put_mutable(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError>;

    /// Replace the contents of a mutable document.
    async fn update_mutable(
        &self,
        uri: &ObjectUri,
        data: Bytes,
        auth: &WriterAuth,
    ) -> Result<(), StorageError>;

    /// Fetch the current bytes of an object.
    async fn get(&self, uri: &ObjectUri) -> Result<Bytes, StorageError>;

    /// Resolve an object to a URL a generic transport can fetch directly.
    async fn resolve(&self, uri: &ObjectUri) -> Result<url::Url, StorageError>;
}

pub(crate) fn require_immutable(acl: &Acl) -> Result<(), StorageError> {
    match acl {
        Acl::ImmutablePublic => Ok(()),
        other => Err(StorageError::InvalidAcl {
            acl: other.name(),
            operation: "put",
        }),
    }
}

pub(crate) fn require_writer_only(acl: &Acl) -> Result<&crate::acl::Identity, StorageError> {
    match acl {
        Acl::WriterOnly(owner) => Ok(owner),
        other => Err(StorageError::InvalidAcl {
            acl: other.name(),
            operation: "put_mutable",
        }),
    }
}

pub(crate) fn require_document(uri: &ObjectUri) -> Result<(), StorageError> {
    if uri.is_document() {
        Ok(())
    } else {
        Err(StorageError::InvalidUri(format!(
            "{} is immutable content, not a document",
            uri
        )))
    }
}
