//! Storage gateway for chunkcast.
//!
//! Two access classes, matching how a live stream is stored:
//! - **Immutable segments**: content-addressed, public-read, write-once.
//!   Storing identical bytes twice yields the same `cas://` URI.
//! - **Mutable documents**: the stream manifest. Created under a writer-only
//!   ACL; only the owning identity may replace its bytes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use castore::{Acl, FileGateway, Identity, StorageGateway, WriterAuth};
//!
//! # async fn demo() -> Result<(), castore::StorageError> {
//! let gateway = FileGateway::at_path("/tmp/chunkcast-store")?;
//!
//! let segment = gateway.put(Bytes::from_static(b"..."), Acl::ImmutablePublic).await?;
//! let manifest = gateway
//!     .put_mutable(Bytes::from_static(b"{}"), Acl::WriterOnly(Identity::from("alice")))
//!     .await?;
//! gateway
//!     .update_mutable(&manifest, Bytes::from_static(b"{}"), &WriterAuth::new("alice"))
//!     .await?;
//!
//! println!("segment at {}", gateway.resolve(&segment).await?);
//! # Ok(())
//! # }
//! ```
//!
//! Backends are allowed to be eventually consistent and never push changes;
//! readers discover updates by polling `get`.

pub mod acl;
pub mod error;
pub mod file;
pub mod gateway;
pub mod memory;
pub mod metadata;
pub mod uri;

pub use acl::{Acl, Identity, WriterAuth};
pub use error::StorageError;
pub use file::FileGateway;
pub use gateway::StorageGateway;
pub use memory::MemoryGateway;
pub use metadata::DocumentMetadata;
pub use uri::{ContentHash, DocumentId, ObjectUri};
