//! Manifest poller: re-reads the manifest on a fixed interval and hands
//! every new segment to the feeder in index order.
//!
//! The storage backend has no change notification, so this is a plain pull
//! loop. Each fetched manifest is checked against the previous one; a
//! manifest that shrinks, rewrites history or goes back to `live` is an
//! invariant violation and stops the poller. The exception is a read that
//! is simply an older revision of the cached copy (a lagging replica): it
//! is ignored and the cached manifest stays current.

use std::sync::Arc;
use std::time::Duration;

use castconf::ConsumerConfig;
use castore::{ObjectUri, StorageGateway};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::feeder::{FeedReport, SegmentFeeder};
use crate::error::StreamError;
use crate::manifest::Manifest;
use crate::retry::{retry, BackoffPolicy, RetryError};

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub report: FeedReport,
    /// The manifest read says the stream has ended.
    pub ended: bool,
    /// This poll issued the end-of-stream signal.
    pub end_signalled: bool,
    /// The manifest could not be read this round; nothing was applied.
    pub stalled: bool,
}

pub struct ManifestPoller {
    gateway: Arc<dyn StorageGateway>,
    manifest_uri: ObjectUri,
    policy: BackoffPolicy,
    interval: Duration,
    manifest: Option<Manifest>,
}

impl ManifestPoller {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        manifest_uri: ObjectUri,
        config: &ConsumerConfig,
    ) -> Self {
        let policy = BackoffPolicy::new(config.fetch_backoff_base(), config.fetch_backoff_max())
            .with_max_attempts(config.manifest_max_attempts);
        Self {
            gateway,
            manifest_uri,
            policy,
            interval: config.poll_interval().max(Duration::from_millis(1)),
            manifest: None,
        }
    }

    pub fn manifest_uri(&self) -> &ObjectUri {
        &self.manifest_uri
    }

    /// Most recent manifest accepted.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Read the manifest, retrying transient failures, and accept it as
    /// current. Exhausted retries are returned as the last storage error.
    #[instrument(skip_all, fields(stream.uri = %self.manifest_uri))]
    pub async fn load_manifest(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&Manifest, StreamError> {
        let next = self.fetch(cancel).await.map_err(RetryError::into_error)?;
        self.accept(next)
    }

    /// Feed up to `count` segments from the current manifest before playback
    /// is signalled ready.
    pub async fn bootstrap(
        &mut self,
        feeder: &mut SegmentFeeder,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<FeedReport, StreamError> {
        let Some(manifest) = self.manifest.as_ref() else {
            return Err(StreamError::invalid_transition("bootstrap", "unloaded"));
        };
        let initial: Vec<_> = manifest
            .segments_after(feeder.cursor())
            .iter()
            .take(count)
            .cloned()
            .collect();
        info!(
            stream.uri = %self.manifest_uri,
            segments = initial.len(),
            available = manifest.chunks.len(),
            "bootstrapping playback"
        );
        feeder.feed(&initial, cancel).await
    }

    /// Re-read the manifest and apply whatever is new.
    ///
    /// Once end-of-stream has been signalled this does nothing, so repeated
    /// polls after termination never signal again.
    pub async fn poll_once(
        &mut self,
        feeder: &mut SegmentFeeder,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, StreamError> {
        if feeder.is_ended() {
            return Ok(PollOutcome {
                ended: true,
                ..PollOutcome::default()
            });
        }

        let next = match self.fetch(cancel).await {
            Ok(next) => next,
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    stream.uri = %self.manifest_uri,
                    attempts,
                    error = %last,
                    "manifest poll failed, waiting for next interval"
                );
                return Ok(PollOutcome {
                    stalled: true,
                    ..PollOutcome::default()
                });
            }
            Err(err) => return Err(err.into_error()),
        };
        self.accept(next)?;
        self.apply(feeder, cancel).await
    }

    /// Poll until end-of-stream has been signalled or `cancel` fires.
    ///
    /// The first poll happens one interval from now; a manifest that had
    /// already ended when loaded is finished without waiting.
    #[instrument(skip_all, fields(stream.uri = %self.manifest_uri))]
    pub async fn run(
        &mut self,
        feeder: &mut SegmentFeeder,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        if self.manifest.as_ref().is_some_and(Manifest::is_ended) {
            self.apply(feeder, cancel).await?;
            if feeder.is_ended() {
                return Ok(());
            }
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = ticker.tick() => {}
            }

            self.poll_once(feeder, cancel).await?;
            if feeder.is_ended() {
                return Ok(());
            }
        }
    }

    /// Feed the delta between the feeder's cursor and the current manifest,
    /// then signal end-of-stream if the manifest has ended.
    async fn apply(
        &mut self,
        feeder: &mut SegmentFeeder,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, StreamError> {
        let Some(manifest) = self.manifest.as_ref() else {
            return Ok(PollOutcome::default());
        };
        let ended = manifest.is_ended();
        let delta = manifest.segments_after(feeder.cursor()).to_vec();

        debug!(
            stream.uri = %self.manifest_uri,
            cursor = ?feeder.cursor(),
            new_segments = delta.len(),
            ended,
            "manifest polled"
        );

        let report = feeder.feed(&delta, cancel).await?;
        let end_signalled = ended && feeder.finish().await?;
        Ok(PollOutcome {
            report,
            ended,
            end_signalled,
            stalled: false,
        })
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Manifest, RetryError> {
        let gateway = self.gateway.as_ref();
        let uri = &self.manifest_uri;
        retry(
            &self.policy,
            cancel,
            move |_| async move {
                let data = gateway.get(uri).await?;
                Manifest::decode(&data)
            },
            |attempt, err, delay| {
                warn!(
                    stream.uri = %uri,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "manifest read failed, retrying"
                );
            },
        )
        .await
    }

    fn accept(&mut self, next: Manifest) -> Result<&Manifest, StreamError> {
        let stale = match &self.manifest {
            Some(current) if next.is_earlier_revision_of(current) => {
                debug!(
                    stream.uri = %self.manifest_uri,
                    cached_chunks = current.chunks.len(),
                    read_chunks = next.chunks.len(),
                    "stale manifest read ignored"
                );
                true
            }
            Some(current) => {
                current.check_successor(&next)?;
                false
            }
            None => false,
        };
        if stale {
            Ok(self.manifest.get_or_insert(next))
        } else {
            Ok(self.manifest.insert(next))
        }
    }
}
