//! Sidecar metadata kept next to each mutable document.

use serde::{Deserialize, Serialize};

use crate::acl::Identity;

/// Ownership and revision information for a mutable document.
///
/// Stored as JSON in the metadata directory with the same prefix/remainder
/// layout as the document itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// The only identity allowed to update the document.
    pub owner: Identity,

    /// Incremented on every successful update; 0 after creation.
    pub revision: u64,

    /// Size of the current revision in bytes.
    pub size: u64,
}

impl DocumentMetadata {
    pub fn new(owner: Identity, size: u64) -> Self {
        Self {
            owner,
            revision: 0,
            size,
        }
    }

    /// Metadata for the next revision of `size` bytes.
    pub fn next(&self, size: u64) -> Self {
        Self {
            owner: self.owner.clone(),
            revision: self.revision + 1,
            size,
        }
    }
}
