//! Stream manifest - the mutable pointer document listing a stream's segments.
//!
//! The JSON form is the contract between producer and consumers:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "title": "Night set",
//!   "creator": "alice",
//!   "startedAt": 1700000000000,
//!   "endedAt": null,
//!   "chunkCount": 1,
//!   "chunks": [{ "uri": "cas://…", "index": 0, "timestamp": 1700000030000 }],
//!   "status": "live"
//! }
//! ```
//!
//! Only the creator mutates a manifest. Consumers hold read-only copies and
//! check each refreshed copy against the previous one with
//! [`Manifest::check_successor`].

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use castore::{Identity, ObjectUri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StreamError;

pub const MANIFEST_VERSION: &str = "1.0";

/// Lifecycle status. Moves only from `Live` to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Live,
    Ended,
}

/// Reference to one immutable segment object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub uri: ObjectUri,
    pub index: u64,
    /// Commit time, ms since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub title: String,
    pub creator: Identity,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub chunk_count: u64,
    pub chunks: Vec<SegmentRef>,
    pub status: Status,
}

/// Ways a manifest, or a manifest update, can break the contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("chunkCount is {chunk_count} but {actual} chunks are listed")]
    CountMismatch { chunk_count: u64, actual: usize },

    #[error("chunk at position {position} has index {index}")]
    IndexGap { position: usize, index: u64 },

    #[error("endedAt must be set exactly when status is ended")]
    EndedAtMismatch,

    #[error("endedAt {ended_at} precedes startedAt {started_at}")]
    EndedBeforeStart { started_at: i64, ended_at: i64 },

    #[error("manifest has already ended")]
    AlreadyEnded,

    #[error("status went from ended back to live")]
    StatusRegression,

    #[error("chunk list shrank from {previous} to {current}")]
    Shrunk { previous: usize, current: usize },

    #[error("chunk {index} was rewritten")]
    HistoryRewritten { index: u64 },

    #[error("creator changed from {previous} to {current}")]
    CreatorChanged { previous: Identity, current: Identity },

    #[error("endedAt changed after it was set")]
    EndedAtChanged,
}

/// Current wall-clock time in ms since the epoch.
pub fn now_ms() -> Result<i64, StreamError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| StreamError::Clock(e.to_string()))?;
    i64::try_from(elapsed.as_millis())
        .map_err(|_| StreamError::Clock("timestamp out of range".to_string()))
}

impl Manifest {
    /// Create a live manifest with no segments, stamped with the current time.
    pub fn new(title: impl Into<String>, creator: impl Into<Identity>) -> Result<Self, StreamError> {
        Self::starting_at(title, creator, now_ms()?)
    }

    pub fn starting_at(
        title: impl Into<String>,
        creator: impl Into<Identity>,
        started_at: i64,
    ) -> Result<Self, StreamError> {
        let creator = creator.into();
        if creator.as_str().trim().is_empty() {
            return Err(StreamError::Identity("creator must not be empty".to_string()));
        }
        Ok(Self {
            version: MANIFEST_VERSION.to_string(),
            title: title.into(),
            creator,
            started_at,
            ended_at: None,
            chunk_count: 0,
            chunks: Vec::new(),
            status: Status::Live,
        })
    }

    /// Append the next segment. Its index is the current chunk count.
    pub fn append(&mut self, uri: ObjectUri, timestamp: i64) -> Result<&SegmentRef, ManifestError> {
        if self.is_ended() {
            return Err(ManifestError::AlreadyEnded);
        }
        let index = self.chunks.len() as u64;
        self.chunks.push(SegmentRef {
            uri,
            index,
            timestamp,
        });
        self.chunk_count = self.chunks.len() as u64;
        let appended = &self.chunks[self.chunks.len() - 1];
        Ok(appended)
    }

    /// Mark the stream ended. Fails if it already is.
    pub fn finish(&mut self, ended_at: i64) -> Result<(), ManifestError> {
        if self.is_ended() {
            return Err(ManifestError::AlreadyEnded);
        }
        self.status = Status::Ended;
        self.ended_at = Some(ended_at);
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.status == Status::Ended
    }

    /// Index of the newest segment, if any.
    pub fn last_index(&self) -> Option<u64> {
        self.chunks.last().map(|chunk| chunk.index)
    }

    /// Check the structural invariants of a single manifest.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.chunk_count != self.chunks.len() as u64 {
            return Err(ManifestError::CountMismatch {
                chunk_count: self.chunk_count,
                actual: self.chunks.len(),
            });
        }
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != position as u64 {
                return Err(ManifestError::IndexGap {
                    position,
                    index: chunk.index,
                });
            }
        }
        match (self.status, self.ended_at) {
            (Status::Live, None) => {}
            (Status::Ended, Some(ended_at)) if ended_at < self.started_at => {
                return Err(ManifestError::EndedBeforeStart {
                    started_at: self.started_at,
                    ended_at,
                });
            }
            (Status::Ended, Some(_)) => {}
            _ => return Err(ManifestError::EndedAtMismatch),
        }
        Ok(())
    }

    /// Check that `next` is a legal later revision of `self`: same creator,
    /// no status regression, and committed chunks are never removed or
    /// rewritten.
    pub fn check_successor(&self, next: &Manifest) -> Result<(), ManifestError> {
        if next.creator != self.creator {
            return Err(ManifestError::CreatorChanged {
                previous: self.creator.clone(),
                current: next.creator.clone(),
            });
        }
        if self.is_ended() && !next.is_ended() {
            return Err(ManifestError::StatusRegression);
        }
        if self.ended_at.is_some() && next.ended_at != self.ended_at {
            return Err(ManifestError::EndedAtChanged);
        }
        if next.chunks.len() < self.chunks.len() {
            return Err(ManifestError::Shrunk {
                previous: self.chunks.len(),
                current: next.chunks.len(),
            });
        }
        if let Some(changed) = self
            .chunks
            .iter()
            .zip(next.chunks.iter())
            .find(|(before, after)| before != after)
        {
            return Err(ManifestError::HistoryRewritten {
                index: changed.0.index,
            });
        }
        Ok(())
    }

    /// True when `self` reads like an older revision of the live manifest
    /// `current`: same stream and creator, still live, and its chunks are a
    /// strict prefix of `current`'s. An eventually consistent store can serve
    /// such a copy after a newer one has already been read.
    pub fn is_earlier_revision_of(&self, current: &Manifest) -> bool {
        self.creator == current.creator
            && self.started_at == current.started_at
            && !self.is_ended()
            && !current.is_ended()
            && self.chunks.len() < current.chunks.len()
            && current.chunks.starts_with(&self.chunks)
    }

    /// Segments with an index greater than `cursor`, in index order.
    /// A `None` cursor means nothing has been consumed yet.
    ///
    /// Relies on the contiguity checked by [`Manifest::validate`].
    pub fn segments_after(&self, cursor: Option<u64>) -> &[SegmentRef] {
        let start = cursor.map_or(0, |index| index.saturating_add(1));
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        &self.chunks[start.min(self.chunks.len())..]
    }

    pub fn to_bytes(&self) -> Result<Bytes, StreamError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse without validating; see [`Manifest::decode`].
    pub fn parse(data: &[u8]) -> Result<Self, StreamError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Parse and validate.
    pub fn decode(data: &[u8]) -> Result<Self, StreamError> {
        let manifest = Self::parse(data)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castore::ContentHash;
    use pretty_assertions::assert_eq;

    fn segment_uri(value: u8) -> ObjectUri {
        ObjectUri::Content(ContentHash::from_data(&[value; 32]))
    }

    fn live_with(count: u8) -> Manifest {
        let mut manifest = Manifest::starting_at("set", "alice", 1_000).unwrap();
        for i in 0..count {
            manifest.append(segment_uri(i), 2_000 + i as i64).unwrap();
        }
        manifest
    }

    #[test]
    fn test_new_manifest() {
        let manifest = Manifest::new("Night set", "alice").unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.status, Status::Live);
        assert_eq!(manifest.chunk_count, 0);
        assert_eq!(manifest.ended_at, None);
        assert!(manifest.started_at > 0);
        manifest.validate().unwrap();
    }

    #[test]
    fn test_empty_creator_rejected() {
        let result = Manifest::new("set", "  ");
        assert!(matches!(result, Err(StreamError::Identity(_))));
    }

    #[test]
    fn test_append_assigns_contiguous_indices() {
        let manifest = live_with(3);
        let indices: Vec<u64> = manifest.chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(manifest.last_index(), Some(2));
        manifest.validate().unwrap();
    }

    #[test]
    fn test_finish_once() {
        let mut manifest = live_with(1);
        manifest.finish(5_000).unwrap();
        assert!(manifest.is_ended());
        assert_eq!(manifest.ended_at, Some(5_000));
        manifest.validate().unwrap();

        assert_eq!(manifest.finish(6_000), Err(ManifestError::AlreadyEnded));
        assert_eq!(
            manifest.append(segment_uri(9), 7_000).map(|_| ()),
            Err(ManifestError::AlreadyEnded)
        );
    }

    #[test]
    fn test_wire_format_field_names() {
        let mut manifest = live_with(1);
        manifest.finish(9_000).unwrap();
        let json: serde_json::Value = serde_json::to_value(&manifest).unwrap();

        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        for key in [
            "version",
            "title",
            "creator",
            "startedAt",
            "endedAt",
            "chunkCount",
            "chunks",
            "status",
        ] {
            assert!(keys.contains(&key), "missing {key}");
        }
        assert_eq!(json["status"], "ended");
        assert_eq!(json["creator"], "alice");
        assert_eq!(json["chunks"][0]["index"], 0);
        assert!(json["chunks"][0]["uri"]
            .as_str()
            .unwrap()
            .starts_with("cas://"));
    }

    #[test]
    fn test_live_manifest_serializes_null_ended_at() {
        let json = String::from_utf8(live_with(0).to_bytes().unwrap().to_vec()).unwrap();
        assert!(json.contains("\"endedAt\":null"));
        assert!(json.contains("\"status\":\"live\""));
        assert!(json.contains("\"chunkCount\":0"));
    }

    #[test]
    fn test_decode_accepts_external_document() {
        let uri = segment_uri(1);
        let raw = format!(
            r#"{{"version":"1.0","title":"t","creator":"bob","startedAt":10,"endedAt":null,
                "chunkCount":1,"chunks":[{{"uri":"{uri}","index":0,"timestamp":11}}],"status":"live"}}"#
        );
        let manifest = Manifest::decode(raw.as_bytes()).unwrap();
        assert_eq!(manifest.creator, Identity::from("bob"));
        assert_eq!(manifest.chunks[0].uri, uri);
    }

    #[test]
    fn test_validate_detects_gap() {
        let mut manifest = live_with(3);
        manifest.chunks.remove(1);
        manifest.chunk_count = 2;
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::IndexGap {
                position: 1,
                index: 2
            })
        );
    }

    #[test]
    fn test_validate_detects_count_mismatch() {
        let mut manifest = live_with(2);
        manifest.chunk_count = 5;
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::CountMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_detects_status_inconsistency() {
        let mut manifest = live_with(0);
        manifest.status = Status::Ended;
        assert_eq!(manifest.validate(), Err(ManifestError::EndedAtMismatch));

        let mut manifest = live_with(0);
        manifest.ended_at = Some(2_000);
        assert_eq!(manifest.validate(), Err(ManifestError::EndedAtMismatch));
    }

    #[test]
    fn test_decode_rejects_invalid() {
        let mut manifest = live_with(2);
        manifest.chunks[1].index = 7;
        let bytes = serde_json::to_vec(&manifest).unwrap();
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(StreamError::ManifestInvariantViolation(
                ManifestError::IndexGap { .. }
            ))
        ));
        assert!(Manifest::parse(&bytes).is_ok());
    }

    #[test]
    fn test_successor_checks() {
        let base = live_with(2);

        let grown = live_with(3);
        base.check_successor(&grown).unwrap();
        base.check_successor(&base).unwrap();

        let shrunk = live_with(1);
        assert!(matches!(
            base.check_successor(&shrunk),
            Err(ManifestError::Shrunk { .. })
        ));

        let mut rewritten = live_with(3);
        rewritten.chunks[1].uri = segment_uri(99);
        assert_eq!(
            base.check_successor(&rewritten),
            Err(ManifestError::HistoryRewritten { index: 1 })
        );

        let mut ended = live_with(2);
        ended.finish(9_000).unwrap();
        base.check_successor(&ended).unwrap();
        assert_eq!(
            ended.check_successor(&base),
            Err(ManifestError::StatusRegression)
        );

        let mut foreign = live_with(2);
        foreign.creator = Identity::from("mallory");
        assert!(matches!(
            base.check_successor(&foreign),
            Err(ManifestError::CreatorChanged { .. })
        ));
    }

    #[test]
    fn test_earlier_revision_detection() {
        let current = live_with(3);
        assert!(live_with(1).is_earlier_revision_of(&current));
        assert!(live_with(0).is_earlier_revision_of(&current));
        assert!(!current.is_earlier_revision_of(&current));
        assert!(!live_with(4).is_earlier_revision_of(&current));

        let mut diverged = live_with(2);
        diverged.chunks[1].uri = segment_uri(99);
        assert!(!diverged.is_earlier_revision_of(&current));

        let mut foreign = live_with(1);
        foreign.creator = Identity::from("mallory");
        assert!(!foreign.is_earlier_revision_of(&current));

        let mut ended = live_with(3);
        ended.finish(9_000).unwrap();
        assert!(!live_with(2).is_earlier_revision_of(&ended));
    }

    #[test]
    fn test_segments_after() {
        let manifest = live_with(4);
        assert_eq!(manifest.segments_after(None).len(), 4);
        let tail: Vec<u64> = manifest
            .segments_after(Some(1))
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(tail, vec![2, 3]);
        assert!(manifest.segments_after(Some(3)).is_empty());
        assert!(manifest.segments_after(Some(10)).is_empty());
        assert!(manifest.segments_after(Some(u64::MAX)).is_empty());
    }
}
