//! In-process storage gateway, for tests and single-process embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::acl::{Acl, WriterAuth};
use crate::error::StorageError;
use crate::gateway::{require_document, require_immutable, require_writer_only, StorageGateway};
use crate::metadata::DocumentMetadata;
use crate::uri::{ContentHash, DocumentId, ObjectUri};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    document: Option<DocumentMetadata>,
}

/// Storage gateway holding everything in a map.
///
/// Strongly consistent, unlike real backends; wrap it to inject delay or
/// failures.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    objects: RwLock<HashMap<ObjectUri, Entry>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects (segments and documents).
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Current revision of a document.
    pub async fn revision(&self, uri: &ObjectUri) -> Result<u64, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(uri)
            .and_then(|entry| entry.document.as_ref())
            .map(|meta| meta.revision)
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn put(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        require_immutable(&acl)?;
        let uri = ObjectUri::Content(ContentHash::from_data(&data));
        let mut objects = self.objects.write().await;
        objects.entry(uri.clone()).or_insert(Entry {
            data,
            document: None,
        });
        Ok(uri)
    }

    async fn put_mutable(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        let owner = require_writer_only(&acl)?.clone();
        let uri = ObjectUri::Document(DocumentId::new());
        let metadata = DocumentMetadata::new(owner, data.len() as u64);
        self.objects.write().await.insert(
            uri.clone(),
            Entry {
                data,
                document: Some(metadata),
            },
        );
        Ok(uri)
    }

    async fn update_mutable(
        &self,
        uri: &ObjectUri,
        data: Bytes,
        auth: &WriterAuth,
    ) -> Result<(), StorageError> {
        require_document(uri)?;
        let mut objects = self.objects.write().await;
        let entry = objects
            .get_mut(uri)
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))?;
        let metadata = entry
            .document
            .as_ref()
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
        if !auth.authorizes(&metadata.owner) {
            return Err(StorageError::AuthorizationDenied {
                uri: uri.to_string(),
                reason: format!("{} is not the document owner", auth.identity()),
            });
        }
        let next = metadata.next(data.len() as u64);
        entry.data = data;
        entry.document = Some(next);
        Ok(())
    }

    async fn get(&self, uri: &ObjectUri) -> Result<Bytes, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(uri)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    async fn resolve(&self, uri: &ObjectUri) -> Result<url::Url, StorageError> {
        if !self.objects.read().await.contains_key(uri) {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        url::Url::parse(&format!("memory:///{}", uri.key()))
            .map_err(|_| StorageError::InvalidUri(uri.to_string()))
    }
}
