//! Object addressing: content hashes for immutable segments, random document
//! ids for mutable documents, and the `ObjectUri` that wraps both.
//!
//! Wire form:
//! - `cas://<32 hex>` - immutable, content-addressed (BLAKE3 truncated to 128 bits)
//! - `doc://<32 hex>` - mutable, writer-owned document

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StorageError;

const CONTENT_SCHEME: &str = "cas://";
const DOCUMENT_SCHEME: &str = "doc://";
const KEY_LEN: usize = 32;

/// A content hash - 128 bits (32 hex chars) of BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash data and return the content hash.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a mutable document. Random, not derived from content,
/// since the document's bytes change on every update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4();
        let digest = blake3::hash(seed.as_bytes());
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of an object held by a storage gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObjectUri {
    /// Immutable content, addressed by hash.
    Content(ContentHash),
    /// Mutable document, addressed by id.
    Document(DocumentId),
}

impl ObjectUri {
    /// The bare 32-char key, scheme stripped.
    pub fn key(&self) -> &str {
        match self {
            ObjectUri::Content(hash) => hash.as_str(),
            ObjectUri::Document(id) => id.as_str(),
        }
    }

    /// First two key characters (directory sharding).
    pub fn prefix(&self) -> &str {
        &self.key()[..2]
    }

    /// Key remainder after the prefix (file name).
    pub fn remainder(&self) -> &str {
        &self.key()[2..]
    }

    pub fn is_content(&self) -> bool {
        matches!(self, ObjectUri::Content(_))
    }

    pub fn is_document(&self) -> bool {
        matches!(self, ObjectUri::Document(_))
    }
}

fn checked_key(s: &str, original: &str) -> Result<String, StorageError> {
    if s.len() != KEY_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidUri(original.to_string()));
    }
    Ok(s.to_ascii_lowercase())
}

impl FromStr for ObjectUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(CONTENT_SCHEME) {
            Ok(ObjectUri::Content(ContentHash(checked_key(rest, s)?)))
        } else if let Some(rest) = s.strip_prefix(DOCUMENT_SCHEME) {
            Ok(ObjectUri::Document(DocumentId(checked_key(rest, s)?)))
        } else {
            Err(StorageError::InvalidUri(s.to_string()))
        }
    }
}

impl TryFrom<String> for ObjectUri {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectUri> for String {
    fn from(uri: ObjectUri) -> Self {
        uri.to_string()
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectUri::Content(hash) => write!(f, "{}{}", CONTENT_SCHEME, hash.as_str()),
            ObjectUri::Document(id) => write!(f, "{}{}", DOCUMENT_SCHEME, id.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = ContentHash::from_data(b"segment bytes");
        let b = ContentHash::from_data(b"segment bytes");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, ContentHash::from_data(b"other bytes"));
    }

    #[test]
    fn test_known_hash_value() {
        let hash = ContentHash::from_data(b"Concurrent Data");
        assert_eq!(hash.as_str(), "5c735d76fe3537a0f35cf4a4eb14a532");
    }

    #[test]
    fn test_document_ids_are_unique() {
        assert_ne!(DocumentId::new(), DocumentId::new());
    }

    #[test]
    fn test_parse_and_display() {
        let uri: ObjectUri = "cas://5c735d76fe3537a0f35cf4a4eb14a532".parse().unwrap();
        assert!(uri.is_content());
        assert_eq!(uri.to_string(), "cas://5c735d76fe3537a0f35cf4a4eb14a532");
        assert_eq!(uri.prefix(), "5c");
        assert_eq!(uri.remainder().len(), 30);

        let doc = ObjectUri::Document(DocumentId::new());
        let reparsed: ObjectUri = doc.to_string().parse().unwrap();
        assert_eq!(doc, reparsed);
        assert!(reparsed.is_document());
    }

    #[test]
    fn test_uppercase_key_is_normalized() {
        let uri: ObjectUri = "doc://ABCDEF01234567890123456789ABCDEF".parse().unwrap();
        assert_eq!(uri.key(), "abcdef01234567890123456789abcdef");
    }

    #[test]
    fn test_rejects_bad_uris() {
        for bad in [
            "",
            "cas://short",
            "http://5c735d76fe3537a0f35cf4a4eb14a532",
            "doc://zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
        ] {
            assert!(
                matches!(bad.parse::<ObjectUri>(), Err(StorageError::InvalidUri(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        let uri = ObjectUri::Content(ContentHash::from_data(b"x"));
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, format!("\"{}\"", uri));
        let restored: ObjectUri = serde_json::from_str(&json).unwrap();
        assert_eq!(uri, restored);
        assert!(serde_json::from_str::<ObjectUri>("\"nope\"").is_err());
    }
}
