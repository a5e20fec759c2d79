//! chunkcast - chunked live-stream transport over content-addressed storage.
//!
//! A broadcaster slices encoded media into immutable segments, uploads each
//! one, and appends a reference to a mutable manifest document. Viewers poll
//! the manifest and feed the referenced segments, strictly in index order,
//! into a decoder sink.
//!
//! - [`manifest`]: the JSON contract both sides agree on
//! - [`producer`]: segmenter, single-flight upload sequencer, session lifecycle
//! - [`consumer`]: manifest poller, segment feeder, decoder sinks, session lifecycle
//! - [`retry`]: bounded exponential backoff shared by both sides
//!
//! Storage lives behind [`castore::StorageGateway`]; configuration comes
//! from [`castconf`].

pub mod consumer;
pub mod error;
pub mod manifest;
pub mod producer;
pub mod retry;
pub mod telemetry;

pub use consumer::{PlaybackEvent, PlaybackHandle, PlaybackSession, PlaybackState};
pub use error::{Component, SessionFailure, StreamError};
pub use manifest::{Manifest, ManifestError, SegmentRef, Status};
pub use producer::{FinalizeReport, ProducerEvent, ProducerSession, ProducerState, Segmenter};
pub use retry::BackoffPolicy;
