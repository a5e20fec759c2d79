//! Segment buffer feeder - fetches segments and appends them to the decoder
//! sink strictly in index order.
//!
//! Up to `prefetch_depth` fetches run at once, each in its own task with its
//! own retry budget. Results are consumed in queue order, so a segment that
//! finishes downloading early is held until every predecessor has been
//! appended or given up on.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use castconf::ConsumerConfig;
use castore::{ContentHash, ObjectUri, StorageGateway};
use futures::stream::{FuturesOrdered, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{DecoderSink, SinkError};
use super::PlaybackEvent;
use crate::error::StreamError;
use crate::manifest::SegmentRef;
use crate::retry::{pause, retry, BackoffPolicy, RetryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeederConfig {
    pub prefetch_depth: usize,
    pub fetch_policy: BackoffPolicy,
    pub sink_retry_delay: Duration,
}

impl FeederConfig {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            prefetch_depth: config.prefetch_depth.max(1),
            fetch_policy: BackoffPolicy::new(
                config.fetch_backoff_base(),
                config.fetch_backoff_max(),
            )
            .with_max_attempts(config.fetch_max_attempts),
            sink_retry_delay: config.sink_retry_delay(),
        }
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self::from_config(&ConsumerConfig::default())
    }
}

/// What one [`SegmentFeeder::feed`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub applied: Vec<u64>,
    pub lost: Vec<u64>,
}

pub struct SegmentFeeder {
    gateway: Arc<dyn StorageGateway>,
    sink: Box<dyn DecoderSink>,
    config: FeederConfig,
    pending: VecDeque<SegmentRef>,
    /// Highest index ever queued.
    queued_through: Option<u64>,
    /// Highest index applied or given up on.
    cursor: Option<u64>,
    last_applied: Option<u64>,
    ended: bool,
    events: broadcast::Sender<PlaybackEvent>,
}

impl SegmentFeeder {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        sink: Box<dyn DecoderSink>,
        config: FeederConfig,
        events: broadcast::Sender<PlaybackEvent>,
    ) -> Self {
        Self {
            gateway,
            sink,
            config,
            pending: VecDeque::new(),
            queued_through: None,
            cursor: None,
            last_applied: None,
            ended: false,
            events,
        }
    }

    /// Position the poller computes deltas from. Advances past lost segments.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Last index durably appended to the sink.
    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Queue segments not seen before. Returns how many were queued.
    pub fn enqueue(&mut self, segments: &[SegmentRef]) -> usize {
        if self.ended {
            return 0;
        }
        let mut queued = 0;
        for segment in segments {
            let seen = self.queued_through.max(self.cursor);
            if seen.is_some_and(|seen| segment.index <= seen) {
                continue;
            }
            self.queued_through = Some(segment.index);
            self.pending.push_back(segment.clone());
            queued += 1;
        }
        queued
    }

    /// Queue `segments` and feed everything pending into the sink.
    pub async fn feed(
        &mut self,
        segments: &[SegmentRef],
        cancel: &CancellationToken,
    ) -> Result<FeedReport, StreamError> {
        self.enqueue(segments);
        self.drain(cancel).await
    }

    /// Fetch and append every pending segment, in order.
    ///
    /// Only fatal sink errors and cancellation end this early. A segment
    /// whose fetch retries run out is reported lost and skipped.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> Result<FeedReport, StreamError> {
        let mut report = FeedReport::default();
        let mut inflight = FuturesOrdered::new();

        loop {
            while inflight.len() < self.config.prefetch_depth.max(1) {
                let Some(segment) = self.pending.pop_front() else {
                    break;
                };
                inflight.push_back(spawn_fetch(
                    self.gateway.clone(),
                    self.config.fetch_policy,
                    segment,
                    cancel.clone(),
                ));
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                next = inflight.next() => next,
            };
            let Some((segment, fetched)) = next else {
                break;
            };

            match fetched {
                Ok(data) => {
                    self.append(segment.index, data, cancel).await?;
                    report.applied.push(segment.index);
                }
                Err(RetryError::Cancelled) => return Err(StreamError::Cancelled),
                Err(RetryError::Exhausted { attempts, last }) => {
                    self.mark_lost(segment.index, attempts, &last);
                    report.lost.push(segment.index);
                }
                Err(RetryError::Fatal(err)) => {
                    self.mark_lost(segment.index, 1, &err);
                    report.lost.push(segment.index);
                }
            }
        }

        Ok(report)
    }

    /// Signal end-of-stream once nothing is pending. Returns whether the
    /// signal was issued by this call; it is only ever issued once.
    pub async fn finish(&mut self) -> Result<bool, StreamError> {
        if self.ended || !self.pending.is_empty() {
            return Ok(false);
        }
        self.sink.end_of_stream().await?;
        self.ended = true;
        info!(last_index = ?self.last_applied, "⏹️ end of stream");
        let _ = self.events.send(PlaybackEvent::EndOfStream {
            last_index: self.last_applied,
        });
        Ok(true)
    }

    /// Append one payload, evicting or waiting as the sink asks. The same
    /// bytes are offered until they are accepted.
    async fn append(
        &mut self,
        index: u64,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let size = data.len();
        if let Some(capacity) = self.sink.capacity().filter(|capacity| size > *capacity) {
            warn!(
                segment.index = index,
                segment.bytes = size,
                sink.capacity = capacity,
                "segment can never fit in the decoder sink"
            );
            return Err(StreamError::SinkCapacityExceeded);
        }
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            match self.sink.append(data.clone()).await {
                Ok(()) => break,
                Err(SinkError::CapacityExceeded) => {
                    let freed = match self.sink.evict_consumed().await {
                        Ok(freed) => freed,
                        Err(SinkError::Failed(message)) => return Err(StreamError::Sink(message)),
                        Err(_) => 0,
                    };
                    debug!(segment.index = index, freed, "sink full, evicted consumed bytes");
                    if freed == 0 && !pause(self.config.sink_retry_delay, cancel).await {
                        return Err(StreamError::Cancelled);
                    }
                }
                Err(SinkError::InvalidState) => {
                    debug!(segment.index = index, "sink not ready, retrying append");
                    if !pause(self.config.sink_retry_delay, cancel).await {
                        return Err(StreamError::Cancelled);
                    }
                }
                Err(SinkError::Failed(message)) => return Err(StreamError::Sink(message)),
            }
        }

        self.cursor = Some(index);
        self.last_applied = Some(index);
        debug!(segment.index = index, segment.bytes = size, "segment applied");
        let _ = self
            .events
            .send(PlaybackEvent::SegmentApplied { index, bytes: size });
        Ok(())
    }

    fn mark_lost(&mut self, index: u64, attempts: u32, cause: &StreamError) {
        self.cursor = Some(index);
        let lost = StreamError::SegmentLost { index, attempts };
        warn!(
            segment.index = index,
            attempts,
            error = %cause,
            "segment lost, continuing past gap"
        );
        let _ = self.events.send(PlaybackEvent::SegmentLost {
            index,
            attempts,
            error: format!("{lost}: {cause}"),
        });
    }
}

/// Start fetching in a detached task. If the feeder stops waiting, the
/// fetch still runs to completion and its bytes are discarded.
fn spawn_fetch(
    gateway: Arc<dyn StorageGateway>,
    policy: BackoffPolicy,
    segment: SegmentRef,
    cancel: CancellationToken,
) -> impl Future<Output = (SegmentRef, Result<Bytes, RetryError>)> {
    let uri = segment.uri.clone();
    let index = segment.index;
    let task = tokio::spawn(async move {
        fetch_segment(gateway.as_ref(), &uri, index, &policy, &cancel).await
    });

    async move {
        let fetched = match task.await {
            Ok(fetched) => fetched,
            Err(err) => Err(RetryError::Fatal(StreamError::TaskFailed(err.to_string()))),
        };
        (segment, fetched)
    }
}

async fn fetch_segment(
    gateway: &dyn StorageGateway,
    uri: &ObjectUri,
    index: u64,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<Bytes, RetryError> {
    retry(
        policy,
        cancel,
        move |_| async move {
            let data = gateway.get(uri).await?;
            verify_content(uri, &data)?;
            Ok::<_, StreamError>(data)
        },
        |attempt, err, delay| {
            warn!(
                segment.index = index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "segment fetch failed, retrying"
            );
        },
    )
    .await
}

fn verify_content(uri: &ObjectUri, data: &[u8]) -> Result<(), StreamError> {
    match uri {
        ObjectUri::Content(expected) if ContentHash::from_data(data) != *expected => {
            Err(StreamError::CorruptSegment(uri.to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::sink::BufferedSink;
    use castore::{Acl, MemoryGateway};
    use pretty_assertions::assert_eq;

    fn config() -> FeederConfig {
        FeederConfig {
            prefetch_depth: 2,
            fetch_policy: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20))
                .with_max_attempts(3),
            sink_retry_delay: Duration::from_millis(5),
        }
    }

    async fn store(gateway: &MemoryGateway, count: u64) -> Vec<SegmentRef> {
        let mut refs = Vec::new();
        for index in 0..count {
            let uri = gateway
                .put(Bytes::from(format!("[{index}]")), Acl::ImmutablePublic)
                .await
                .unwrap();
            refs.push(SegmentRef {
                uri,
                index,
                timestamp: 0,
            });
        }
        refs
    }

    #[tokio::test]
    async fn test_feed_appends_in_order() {
        let gateway = Arc::new(MemoryGateway::new());
        let refs = store(&gateway, 4).await;
        let (sink, reader) = BufferedSink::new(1024);
        let (events, _) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);

        let report = feeder
            .feed(&refs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.applied, vec![0, 1, 2, 3]);
        assert_eq!(feeder.last_applied(), Some(3));
        assert_eq!(
            reader.read_available().await,
            Bytes::from_static(b"[0][1][2][3]")
        );
    }

    #[tokio::test]
    async fn test_enqueue_skips_seen_segments() {
        let gateway = Arc::new(MemoryGateway::new());
        let refs = store(&gateway, 3).await;
        let (sink, _reader) = BufferedSink::new(1024);
        let (events, _) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);
        let cancel = CancellationToken::new();

        feeder.feed(&refs[..2], &cancel).await.unwrap();
        assert_eq!(feeder.enqueue(&refs), 1);
        let report = feeder.drain(&cancel).await.unwrap();
        assert_eq!(report.applied, vec![2]);
        assert_eq!(feeder.enqueue(&refs), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_segment_is_lost_and_skipped() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut refs = store(&gateway, 3).await;
        refs[1].uri = ObjectUri::Content(ContentHash::from_data(b"never stored"));

        let (sink, reader) = BufferedSink::new(1024);
        let (events, mut rx) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);

        let report = feeder
            .feed(&refs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.applied, vec![0, 2]);
        assert_eq!(report.lost, vec![1]);
        assert_eq!(feeder.cursor(), Some(2));
        assert_eq!(reader.read_available().await, Bytes::from_static(b"[0][2]"));

        let mut lost = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PlaybackEvent::SegmentLost {
                index,
                attempts,
                error,
            } = event
            {
                assert!(error.starts_with("segment 1 lost after 3 fetch attempts: "), "{error}");
                lost.push((index, attempts));
            }
        }
        assert_eq!(lost, vec![(1, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sink_evicts_then_appends_once() {
        let gateway = Arc::new(MemoryGateway::new());
        let refs = store(&gateway, 2).await;
        let (sink, reader) = BufferedSink::new(4);
        let (events, _) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);
        let cancel = CancellationToken::new();

        feeder.feed(&refs[..1], &cancel).await.unwrap();
        assert_eq!(reader.read_available().await, Bytes::from_static(b"[0]"));

        // "[1]" does not fit next to the unevicted "[0]"
        let report = feeder.feed(&refs, &cancel).await.unwrap();
        assert_eq!(report.applied, vec![1]);
        assert_eq!(reader.buffered().await, 3);
        assert_eq!(reader.read_available().await, Bytes::from_static(b"[1]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segment_larger_than_sink_is_fatal() {
        let gateway = Arc::new(MemoryGateway::new());
        let uri = gateway
            .put(Bytes::from_static(b"12345678"), Acl::ImmutablePublic)
            .await
            .unwrap();
        let refs = vec![SegmentRef {
            uri,
            index: 0,
            timestamp: 0,
        }];
        let (sink, reader) = BufferedSink::new(4);
        let (events, _) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            feeder.feed(&refs, &CancellationToken::new()),
        )
        .await
        .expect("feed should fail instead of waiting on the sink");
        assert!(matches!(result, Err(StreamError::SinkCapacityExceeded)));
        assert_eq!(feeder.last_applied(), None);
        assert_eq!(reader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_content_rejected() {
        let uri = ObjectUri::Content(ContentHash::from_data(b"expected"));
        assert!(verify_content(&uri, b"expected").is_ok());
        assert!(matches!(
            verify_content(&uri, b"tampered"),
            Err(StreamError::CorruptSegment(_))
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_issued_once() {
        let gateway = Arc::new(MemoryGateway::new());
        let (sink, reader) = BufferedSink::new(16);
        let (events, _) = broadcast::channel(16);
        let mut feeder = SegmentFeeder::new(gateway, Box::new(sink), config(), events);

        assert!(feeder.finish().await.unwrap());
        assert!(!feeder.finish().await.unwrap());
        assert!(reader.is_ended().await);
        assert!(feeder.is_ended());
    }
}
