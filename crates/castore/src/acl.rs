//! Access-control classes and writer credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An authorizing identity (the stream creator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The two access-control classes the gateway understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "writer", rename_all = "snake_case")]
pub enum Acl {
    /// Public-read, write-once. Used for segment objects.
    ImmutablePublic,
    /// Public-read, only `identity` may update. Used for manifests.
    WriterOnly(Identity),
}

impl Acl {
    pub fn name(&self) -> &'static str {
        match self {
            Acl::ImmutablePublic => "immutable-public",
            Acl::WriterOnly(_) => "writer-only",
        }
    }
}

/// Credentials presented on mutable writes.
///
/// Signing lives outside this crate; a gateway only checks that the presented
/// identity matches the document owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterAuth {
    identity: Identity,
}

impl WriterAuth {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether these credentials may write a document owned by `owner`.
    pub fn authorizes(&self, owner: &Identity) -> bool {
        &self.identity == owner
    }
}
