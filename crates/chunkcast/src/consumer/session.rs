//! Playback session - drives one consumer from manifest load to
//! end-of-stream on a background task.

use std::sync::Arc;

use castconf::ConsumerConfig;
use castore::{ObjectUri, StorageGateway};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::feeder::{FeederConfig, SegmentFeeder};
use super::poller::ManifestPoller;
use super::sink::SinkFactory;
use super::{PlaybackEvent, PlaybackState};
use crate::error::{Component, SessionFailure, StreamError};

const EVENT_CAPACITY: usize = 256;

const DEFAULT_CODEC_HINT: &str = "application/octet-stream";

/// Consumer configuration waiting to be started. Subscribe before
/// [`start`](PlaybackSession::start) to see every event.
pub struct PlaybackSession {
    gateway: Arc<dyn StorageGateway>,
    sinks: Arc<dyn SinkFactory>,
    config: ConsumerConfig,
    codec_hint: String,
    events: broadcast::Sender<PlaybackEvent>,
}

impl PlaybackSession {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        sinks: Arc<dyn SinkFactory>,
        config: ConsumerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            sinks,
            config,
            codec_hint: DEFAULT_CODEC_HINT.to_string(),
            events,
        }
    }

    /// Passed to the sink factory when the sink is created.
    pub fn with_codec_hint(mut self, codec_hint: impl Into<String>) -> Self {
        self.codec_hint = codec_hint.into();
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Spawn the playback task for the stream at `manifest_uri`.
    pub fn start(self, manifest_uri: ObjectUri) -> PlaybackHandle {
        let (state, receiver) = watch::channel(PlaybackState::Unloaded);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();
        let events = self.events.clone();

        let driver = Driver {
            gateway: self.gateway,
            sinks: self.sinks,
            config: self.config,
            codec_hint: self.codec_hint,
            events: self.events,
            state: state.clone(),
        };
        let span = tracing::info_span!("playback", stream.uri = %manifest_uri);
        let task = tokio::spawn(
            driver
                .run(manifest_uri.clone(), cancel.clone())
                .instrument(span),
        );

        PlaybackHandle {
            manifest_uri,
            state,
            receiver,
            events,
            cancel,
            task: Mutex::new(Join::Running(task)),
        }
    }
}

enum Join {
    Running(JoinHandle<Result<PlaybackState, SessionFailure>>),
    Done(Result<PlaybackState, SessionFailure>),
}

/// A running playback. Dropping the handle does not stop the task; call
/// [`stop`](PlaybackHandle::stop).
pub struct PlaybackHandle {
    manifest_uri: ObjectUri,
    state: Arc<watch::Sender<PlaybackState>>,
    receiver: watch::Receiver<PlaybackState>,
    events: broadcast::Sender<PlaybackEvent>,
    cancel: CancellationToken,
    task: Mutex<Join>,
}

impl PlaybackHandle {
    pub fn manifest_uri(&self) -> &ObjectUri {
        &self.manifest_uri
    }

    pub fn state(&self) -> PlaybackState {
        *self.receiver.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlaybackState> {
        self.receiver.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Cancel polling and wait for the task to release the sink. In-flight
    /// fetches finish in the background and are discarded. Safe to call
    /// more than once.
    pub async fn stop(&self) -> Result<PlaybackState, SessionFailure> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the session to reach a terminal state. The outcome is kept,
    /// so later calls return it again.
    pub async fn join(&self) -> Result<PlaybackState, SessionFailure> {
        let mut slot = self.task.lock().await;
        let result = match &mut *slot {
            Join::Done(result) => return result.clone(),
            Join::Running(task) => match task.await {
                Ok(result) => result,
                Err(err) => {
                    let failure = SessionFailure::new(
                        Component::PlaybackSession,
                        None,
                        StreamError::TaskFailed(err.to_string()),
                    );
                    error!(error = %failure, "playback task died");
                    self.state.send_replace(PlaybackState::Error);
                    let _ = self.events.send(PlaybackEvent::Failed(failure.clone()));
                    Err(failure)
                }
            },
        };
        *slot = Join::Done(result.clone());
        result
    }
}

struct Driver {
    gateway: Arc<dyn StorageGateway>,
    sinks: Arc<dyn SinkFactory>,
    config: ConsumerConfig,
    codec_hint: String,
    events: broadcast::Sender<PlaybackEvent>,
    state: Arc<watch::Sender<PlaybackState>>,
}

impl Driver {
    async fn run(
        self,
        manifest_uri: ObjectUri,
        cancel: CancellationToken,
    ) -> Result<PlaybackState, SessionFailure> {
        let mut poller = ManifestPoller::new(self.gateway.clone(), manifest_uri, &self.config);
        let mut feeder = None;

        let result = self.play(&mut poller, &mut feeder, &cancel).await;
        let last_index = feeder.as_ref().and_then(SegmentFeeder::last_applied);
        // Releases the sink.
        drop(feeder);

        match result {
            Ok(()) => {
                info!(last_index = ?last_index, "playback ended");
                self.set_state(PlaybackState::Ended);
                Ok(PlaybackState::Ended)
            }
            Err((_, StreamError::Cancelled)) => {
                info!(last_index = ?last_index, "playback stopped");
                self.set_state(PlaybackState::Stopped);
                Ok(PlaybackState::Stopped)
            }
            Err((component, err)) => {
                let failure = SessionFailure::new(component, last_index, err);
                error!(error = %failure, "playback failed");
                self.set_state(PlaybackState::Error);
                let _ = self.events.send(PlaybackEvent::Failed(failure.clone()));
                Err(failure)
            }
        }
    }

    async fn play(
        &self,
        poller: &mut ManifestPoller,
        feeder: &mut Option<SegmentFeeder>,
        cancel: &CancellationToken,
    ) -> Result<(), (Component, StreamError)> {
        self.set_state(PlaybackState::Loading);
        let manifest = poller
            .load_manifest(cancel)
            .await
            .map_err(|err| (Component::ManifestPoller, err))?;
        info!(
            stream.title = %manifest.title,
            stream.creator = %manifest.creator,
            segments = manifest.chunks.len(),
            status = ?manifest.status,
            "manifest loaded"
        );

        if cancel.is_cancelled() {
            return Err((Component::PlaybackSession, StreamError::Cancelled));
        }
        let sink = self
            .sinks
            .create_sink(&self.codec_hint)
            .await
            .map_err(|err| (Component::PlaybackSession, err.into()))?;
        let feeder = feeder.insert(SegmentFeeder::new(
            self.gateway.clone(),
            sink,
            FeederConfig::from_config(&self.config),
            self.events.clone(),
        ));

        self.set_state(PlaybackState::Bootstrapping);
        let report = poller
            .bootstrap(feeder, self.config.bootstrap_segments, cancel)
            .await
            .map_err(classify)?;
        info!(
            applied = report.applied.len(),
            lost = report.lost.len(),
            "▶️ ready to play"
        );
        let _ = self.events.send(PlaybackEvent::Ready {
            applied: report.applied.len(),
        });

        self.set_state(PlaybackState::Live);
        poller.run(feeder, cancel).await.map_err(classify)
    }

    fn set_state(&self, state: PlaybackState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "playback state changed");
        }
    }
}

/// Which component a fatal error belongs to once playback is running.
fn classify(err: StreamError) -> (Component, StreamError) {
    let component = match err {
        StreamError::Sink(_)
        | StreamError::SinkCapacityExceeded
        | StreamError::SinkInvalidState
        | StreamError::TaskFailed(_) => Component::SegmentFeeder,
        _ => Component::ManifestPoller,
    };
    (component, err)
}
