//! Segmenter - slices a live byte source into fixed-duration segments.
//!
//! The source is opaque encoded media. A segment is cut every
//! `segment_duration`, or earlier once `max_segment_bytes` are buffered, and
//! whatever remains at end of input becomes the last segment. Bytes read but
//! not yet cut live in the segmenter itself, so a capture interrupted mid-read
//! can still hand them over with [`Segmenter::flush`].

use std::time::Duration;

use bytes::BytesMut;
use castconf::ProducerConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::session::ProducerSession;
use crate::error::StreamError;

const READ_CHUNK: usize = 64 * 1024;

/// `interval_at` rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct Segmenter {
    segment_duration: Duration,
    max_segment_bytes: usize,
    next_index: u64,
    pending: BytesMut,
}

impl Segmenter {
    pub fn new(segment_duration: Duration, max_segment_bytes: usize) -> Self {
        Self {
            segment_duration: segment_duration.max(MIN_PERIOD),
            max_segment_bytes: max_segment_bytes.max(1),
            next_index: 0,
            pending: BytesMut::new(),
        }
    }

    pub fn from_config(config: &ProducerConfig) -> Self {
        Self::new(config.segment_duration(), config.max_segment_bytes)
    }

    /// Capture index the next segment will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Bytes read from the source that have not been cut into a segment.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Read `source` to the end, handing each segment to `session`.
    ///
    /// Returns the number of segments emitted. Dropping the future keeps
    /// whatever was read but not yet cut for [`Segmenter::flush`].
    pub async fn run<R>(&mut self, mut source: R, session: &ProducerSession) -> Result<u64, StreamError>
    where
        R: AsyncRead + Unpin,
    {
        let mut ticker = interval_at(
            Instant::now() + self.segment_duration,
            self.segment_duration,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut emitted = 0u64;

        loop {
            self.pending.reserve(READ_CHUNK.min(self.max_segment_bytes));
            tokio::select! {
                read = source.read_buf(&mut self.pending) => {
                    if read? == 0 {
                        if self.flush(session).await? {
                            emitted += 1;
                        }
                        break;
                    }
                    while self.pending.len() >= self.max_segment_bytes {
                        let full = self.pending.split_to(self.max_segment_bytes).freeze();
                        self.emit(full, session).await?;
                        emitted += 1;
                    }
                }
                _ = ticker.tick() => {
                    if self.flush(session).await? {
                        emitted += 1;
                    }
                }
            }
        }

        info!(segments = emitted, "capture source exhausted");
        Ok(emitted)
    }

    /// Cut everything buffered into one segment. Returns whether a segment
    /// was emitted.
    pub async fn flush(&mut self, session: &ProducerSession) -> Result<bool, StreamError> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let tail = self.pending.split().freeze();
        self.emit(tail, session).await?;
        Ok(true)
    }

    async fn emit(&mut self, data: bytes::Bytes, session: &ProducerSession) -> Result<(), StreamError> {
        debug!(segment.index = self.next_index, segment.bytes = data.len(), "segment cut");
        session.on_segment_ready(data, self.next_index).await?;
        self.next_index += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use bytes::Bytes;
    use castore::{MemoryGateway, StorageGateway, WriterAuth};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    async fn session(gateway: Arc<MemoryGateway>) -> ProducerSession {
        let session = ProducerSession::new(gateway, ProducerConfig::default());
        session
            .initialize(Manifest::new("cap", "alice").unwrap(), WriterAuth::new("alice"))
            .await
            .unwrap();
        session.start_recording().await.unwrap();
        session
    }

    async fn segment_bodies(gateway: &MemoryGateway, manifest: &Manifest) -> Vec<Bytes> {
        let mut bodies = Vec::new();
        for chunk in &manifest.chunks {
            bodies.push(gateway.get(&chunk.uri).await.unwrap());
        }
        bodies
    }

    #[tokio::test]
    async fn test_byte_cap_cuts_segments() {
        let gateway = Arc::new(MemoryGateway::new());
        let session = session(gateway.clone()).await;
        let data: Vec<u8> = (0..25u8).collect();

        let mut segmenter = Segmenter::new(Duration::from_secs(30), 10);
        let emitted = segmenter.run(&data[..], &session).await.unwrap();
        assert_eq!(emitted, 3);
        assert_eq!(segmenter.next_index(), 3);

        session.finalize().await.unwrap();
        let manifest = session.manifest().unwrap();
        let bodies = segment_bodies(&gateway, &manifest).await;
        assert_eq!(
            bodies.iter().map(|b| b.len()).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(bodies.concat(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_boundary_cuts_segments() {
        let gateway = Arc::new(MemoryGateway::new());
        let session = Arc::new(session(gateway.clone()).await);
        let (mut writer, reader) = tokio::io::duplex(1024);

        let capture = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut segmenter = Segmenter::new(Duration::from_secs(2), 1 << 20);
                segmenter.run(reader, &session).await
            })
        };

        writer.write_all(b"abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        writer.write_all(b"def").await.unwrap();
        drop(writer);

        assert_eq!(capture.await.unwrap().unwrap(), 2);
        session.finalize().await.unwrap();

        let manifest = session.manifest().unwrap();
        let bodies = segment_bodies(&gateway, &manifest).await;
        assert_eq!(bodies, vec![Bytes::from("abc"), Bytes::from("def")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_capture_flushes_buffered_bytes() {
        let gateway = Arc::new(MemoryGateway::new());
        let session = session(gateway.clone()).await;
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"partial").await.unwrap();

        let mut segmenter = Segmenter::new(Duration::from_secs(30), 1 << 20);
        tokio::select! {
            result = segmenter.run(reader, &session) => panic!("capture finished early: {result:?}"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        assert_eq!(segmenter.pending_bytes(), 7);
        assert_eq!(segmenter.next_index(), 0);

        assert!(segmenter.flush(&session).await.unwrap());
        assert!(!segmenter.flush(&session).await.unwrap());
        assert_eq!(segmenter.next_index(), 1);
        session.finalize().await.unwrap();

        let manifest = session.manifest().unwrap();
        let bodies = segment_bodies(&gateway, &manifest).await;
        assert_eq!(bodies, vec![Bytes::from("partial")]);
        drop(writer);
    }

    #[tokio::test]
    async fn test_empty_source_emits_nothing() {
        let gateway = Arc::new(MemoryGateway::new());
        let session = session(gateway).await;
        let mut segmenter = Segmenter::new(Duration::from_secs(1), 16);
        assert_eq!(segmenter.run(&b""[..], &session).await.unwrap(), 0);
    }
}
