//! FileGateway: filesystem-backed storage gateway.
//!
//! Layout:
//! ```text
//! {root}/
//! ├── objects/          # immutable segments, content-addressed
//! │   └── ab/cde123...
//! ├── documents/        # mutable documents (current revision)
//! │   └── 12/3456789...
//! ├── metadata/         # owner + revision sidecars for documents
//! │   └── 12/3456789....json
//! └── staging/          # in-progress writes, renamed into place
//! ```
//!
//! Every write lands in `staging/` first and is then renamed over its final
//! path, so a reader never observes a half-written manifest. Document updates
//! take a `.lock` file next to the document; a second concurrent update sees
//! the lock and gets [`StorageError::Conflict`]. A lock older than
//! [`FileGateway::with_stale_lock_after`] is assumed to belong to a writer
//! that died mid-update and is broken.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::acl::{Acl, WriterAuth};
use crate::error::StorageError;
use crate::gateway::{require_document, require_immutable, require_writer_only, StorageGateway};
use crate::metadata::DocumentMetadata;
use crate::uri::{ContentHash, DocumentId, ObjectUri};

/// How long an update lock may sit before another writer breaks it.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// Filesystem storage gateway.
#[derive(Debug, Clone)]
pub struct FileGateway {
    root: PathBuf,
    read_only: bool,
    stale_lock_after: Duration,
}

impl FileGateway {
    /// Open (creating directories as needed) a writable gateway rooted at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let gateway = Self {
            root: path.into(),
            read_only: false,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        };
        for dir in [
            gateway.objects_dir(),
            gateway.documents_dir(),
            gateway.metadata_dir(),
            gateway.staging_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(gateway)
    }

    /// Open a read-only gateway. Consumers only need `get` and `resolve`.
    pub fn read_only_at(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self {
            root: path.into(),
            read_only: true,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        })
    }

    /// Age after which a leftover `.lock` file is treated as abandoned.
    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Path holding the bytes of `uri`.
    fn object_path(&self, uri: &ObjectUri) -> PathBuf {
        let base = if uri.is_content() {
            self.objects_dir()
        } else {
            self.documents_dir()
        };
        base.join(uri.prefix()).join(uri.remainder())
    }

    fn metadata_path(&self, uri: &ObjectUri) -> PathBuf {
        self.metadata_dir()
            .join(uri.prefix())
            .join(format!("{}.json", uri.remainder()))
    }

    fn lock_path(&self, uri: &ObjectUri) -> PathBuf {
        self.documents_dir()
            .join(uri.prefix())
            .join(format!("{}.lock", uri.remainder()))
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Write `data` to a staging file, then rename it over `dest`.
    async fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_dir().join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir_all(self.staging_dir()).await?;
        fs::write(&staging, data).await?;
        if let Err(e) = fs::rename(&staging, dest).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_metadata(&self, uri: &ObjectUri) -> Result<DocumentMetadata, StorageError> {
        let raw = fs::read(self.metadata_path(uri))
            .await
            .map_err(|e| not_found_or_io(e, uri))?;
        serde_json::from_slice(&raw).map_err(|e| {
            StorageError::Unavailable(format!("corrupt metadata for {}: {}", uri, e))
        })
    }

    async fn write_metadata(
        &self,
        uri: &ObjectUri,
        metadata: &DocumentMetadata,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec(metadata).map_err(|e| {
            StorageError::Unavailable(format!("failed to encode metadata for {}: {}", uri, e))
        })?;
        self.write_atomic(&self.metadata_path(uri), &json).await
    }

    /// Current revision of a document, if it exists.
    pub async fn revision(&self, uri: &ObjectUri) -> Result<u64, StorageError> {
        require_document(uri)?;
        Ok(self.read_metadata(uri).await?.revision)
    }
}

fn not_found_or_io(e: std::io::Error, uri: &ObjectUri) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(uri.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Held for the duration of a document update; removes the lock file on drop.
///
/// The lock file records the holder's pid for whoever has to inspect a
/// leftover one by hand.
struct UpdateLock {
    path: PathBuf,
}

impl UpdateLock {
    async fn acquire(
        path: PathBuf,
        uri: &ObjectUri,
        stale_after: Duration,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if Self::try_create(&path).await? {
            return Ok(Self { path });
        }

        let age = lock_age(&path).await?;
        match age {
            Some(age) if age >= stale_after => {
                warn!(
                    document.uri = %uri,
                    lock.age_ms = age.as_millis() as u64,
                    "breaking stale update lock"
                );
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                // Another writer may have raced us to the fresh lock.
                if Self::try_create(&path).await? {
                    Ok(Self { path })
                } else {
                    Err(StorageError::Conflict(uri.to_string()))
                }
            }
            _ => Err(StorageError::Conflict(uri.to_string())),
        }
    }

    /// Create the lock file; `Ok(false)` when it is already held.
    async fn try_create(path: &Path) -> Result<bool, StorageError> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                let pid = format!("{}\n", std::process::id());
                if let Err(e) = file.write_all(pid.as_bytes()).await {
                    let _ = fs::remove_file(path).await;
                    return Err(e.into());
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Time since the lock file was last written. A lock that vanished in the
/// meantime counts as infinitely old; `None` when its mtime lies in the future.
async fn lock_age(path: &Path) -> Result<Option<Duration>, StorageError> {
    let modified = match fs::metadata(path).await {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Some(Duration::MAX)),
        Err(e) => return Err(e.into()),
    };
    Ok(SystemTime::now().duration_since(modified).ok())
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl StorageGateway for FileGateway {
    async fn put(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        self.check_writable()?;
        require_immutable(&acl)?;

        let uri = ObjectUri::Content(ContentHash::from_data(&data));
        let path = self.object_path(&uri);

        // Content-addressed: existing object means identical bytes.
        if fs::try_exists(&path).await? {
            debug!(object.uri = %uri, "object already stored");
            return Ok(uri);
        }
        self.write_atomic(&path, &data).await?;
        debug!(object.uri = %uri, object.size = data.len(), "stored object");
        Ok(uri)
    }

    async fn put_mutable(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        self.check_writable()?;
        let owner = require_writer_only(&acl)?.clone();

        let uri = ObjectUri::Document(DocumentId::new());
        self.write_atomic(&self.object_path(&uri), &data).await?;
        self.write_metadata(&uri, &DocumentMetadata::new(owner, data.len() as u64))
            .await?;
        debug!(document.uri = %uri, "created document");
        Ok(uri)
    }

    async fn update_mutable(
        &self,
        uri: &ObjectUri,
        data: Bytes,
        auth: &WriterAuth,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        require_document(uri)?;

        let _lock = UpdateLock::acquire(self.lock_path(uri), uri, self.stale_lock_after).await?;
        let metadata = self.read_metadata(uri).await?;
        if !auth.authorizes(&metadata.owner) {
            return Err(StorageError::AuthorizationDenied {
                uri: uri.to_string(),
                reason: format!("{} is not the document owner", auth.identity()),
            });
        }

        self.write_atomic(&self.object_path(uri), &data).await?;
        let next = metadata.next(data.len() as u64);
        self.write_metadata(uri, &next).await?;
        debug!(document.uri = %uri, document.revision = next.revision, "updated document");
        Ok(())
    }

    async fn get(&self, uri: &ObjectUri) -> Result<Bytes, StorageError> {
        let data = fs::read(self.object_path(uri))
            .await
            .map_err(|e| not_found_or_io(e, uri))?;
        Ok(Bytes::from(data))
    }

    async fn resolve(&self, uri: &ObjectUri) -> Result<url::Url, StorageError> {
        let path = fs::canonicalize(self.object_path(uri))
            .await
            .map_err(|e| not_found_or_io(e, uri))?;
        url::Url::from_file_path(&path).map_err(|_| StorageError::InvalidUri(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Identity;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileGateway) {
        let temp = TempDir::new().unwrap();
        let gateway = FileGateway::at_path(temp.path()).unwrap();
        (temp, gateway)
    }

    fn writer_only(who: &str) -> Acl {
        Acl::WriterOnly(Identity::from(who))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put(Bytes::from_static(b"segment zero"), Acl::ImmutablePublic)
            .await
            .unwrap();
        assert!(uri.is_content());
        assert_eq!(gateway.get(&uri).await.unwrap(), Bytes::from_static(b"segment zero"));
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_temp, gateway) = setup();
        let a = gateway
            .put(Bytes::from_static(b"same"), Acl::ImmutablePublic)
            .await
            .unwrap();
        let b = gateway
            .put(Bytes::from_static(b"same"), Acl::ImmutablePublic)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_put_rejects_writer_only_acl() {
        let (_temp, gateway) = setup();
        let result = gateway.put(Bytes::from_static(b"x"), writer_only("alice")).await;
        assert!(matches!(result, Err(StorageError::InvalidAcl { .. })));
    }

    #[tokio::test]
    async fn test_mutable_document_lifecycle() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put_mutable(Bytes::from_static(b"v0"), writer_only("alice"))
            .await
            .unwrap();
        assert!(uri.is_document());
        assert_eq!(gateway.revision(&uri).await.unwrap(), 0);

        gateway
            .update_mutable(&uri, Bytes::from_static(b"v1"), &WriterAuth::new("alice"))
            .await
            .unwrap();
        assert_eq!(gateway.get(&uri).await.unwrap(), Bytes::from_static(b"v1"));
        assert_eq!(gateway.revision(&uri).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_by_other_identity_is_denied() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put_mutable(Bytes::from_static(b"v0"), writer_only("alice"))
            .await
            .unwrap();

        let result = gateway
            .update_mutable(&uri, Bytes::from_static(b"evil"), &WriterAuth::new("mallory"))
            .await;
        assert!(matches!(result, Err(StorageError::AuthorizationDenied { .. })));
        assert_eq!(gateway.get(&uri).await.unwrap(), Bytes::from_static(b"v0"));
    }

    #[tokio::test]
    async fn test_concurrent_update_conflicts() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put_mutable(Bytes::from_static(b"v0"), writer_only("alice"))
            .await
            .unwrap();

        let _held = UpdateLock::acquire(gateway.lock_path(&uri), &uri, DEFAULT_STALE_LOCK_AFTER)
            .await
            .unwrap();
        let result = gateway
            .update_mutable(&uri, Bytes::from_static(b"v1"), &WriterAuth::new("alice"))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_leftover_lock_from_crashed_writer_is_broken() {
        let temp = TempDir::new().unwrap();
        let gateway = FileGateway::at_path(temp.path())
            .unwrap()
            .with_stale_lock_after(Duration::from_secs(5));
        let uri = gateway
            .put_mutable(Bytes::from_static(b"v0"), writer_only("alice"))
            .await
            .unwrap();
        let auth = WriterAuth::new("alice");

        // A writer that died mid-update leaves its lock file behind.
        std::fs::write(gateway.lock_path(&uri), b"4242\n").unwrap();
        let fresh = gateway
            .update_mutable(&uri, Bytes::from_static(b"v1"), &auth)
            .await;
        assert!(matches!(fresh, Err(StorageError::Conflict(_))));

        let old = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(gateway.lock_path(&uri))
            .unwrap()
            .set_modified(old)
            .unwrap();

        gateway
            .update_mutable(&uri, Bytes::from_static(b"v1"), &auth)
            .await
            .unwrap();
        assert_eq!(gateway.get(&uri).await.unwrap(), Bytes::from_static(b"v1"));
        assert!(!gateway.lock_path(&uri).exists());
    }

    #[tokio::test]
    async fn test_lock_released_after_update() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put_mutable(Bytes::from_static(b"v0"), writer_only("alice"))
            .await
            .unwrap();
        let auth = WriterAuth::new("alice");
        for i in 1..=3u8 {
            gateway
                .update_mutable(&uri, Bytes::from(vec![i]), &auth)
                .await
                .unwrap();
        }
        assert_eq!(gateway.revision(&uri).await.unwrap(), 3);
        assert!(!gateway.lock_path(&uri).exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_temp, gateway) = setup();
        let uri = ObjectUri::Content(ContentHash::from_data(b"never stored"));
        assert!(matches!(gateway.get(&uri).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_of_content_uri_is_rejected() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put(Bytes::from_static(b"immutable"), Acl::ImmutablePublic)
            .await
            .unwrap();
        let result = gateway
            .update_mutable(&uri, Bytes::from_static(b"x"), &WriterAuth::new("alice"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn test_read_only_gateway() {
        let (temp, writable) = setup();
        let uri = writable
            .put(Bytes::from_static(b"readable"), Acl::ImmutablePublic)
            .await
            .unwrap();

        let readonly = FileGateway::read_only_at(temp.path()).unwrap();
        assert_eq!(readonly.get(&uri).await.unwrap(), Bytes::from_static(b"readable"));
        let result = readonly
            .put(Bytes::from_static(b"nope"), Acl::ImmutablePublic)
            .await;
        assert!(matches!(result, Err(StorageError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_resolve_returns_file_url() {
        let (_temp, gateway) = setup();
        let uri = gateway
            .put(Bytes::from_static(b"resolvable"), Acl::ImmutablePublic)
            .await
            .unwrap();
        let url = gateway.resolve(&uri).await.unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with(uri.remainder()));
    }
}
