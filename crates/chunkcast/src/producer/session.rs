//! Producer session - owns one stream's manifest, sequencer task and
//! lifecycle.

use std::sync::Arc;

use bytes::Bytes;
use castconf::ProducerConfig;
use castore::{StorageGateway, WriterAuth};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sequencer::{PendingSegment, SequencerEnd, SequencerOutcome, UploadSequencer};
use super::{initialize_session, FinalizeReport, ProducerEvent, ProducerState, StreamHandle};
use crate::error::{Component, SessionFailure, StreamError};
use crate::manifest::{now_ms, Manifest};
use crate::retry::{retry, BackoffPolicy, RetryError};

const EVENT_CAPACITY: usize = 256;

/// Attempts for the final ended write when uploads are configured unbounded.
const FINAL_WRITE_ATTEMPTS: u32 = 5;

/// State, snapshot and event channels shared by the session and its
/// sequencer task.
pub(crate) struct ProducerSignals {
    state: watch::Sender<ProducerState>,
    snapshot: watch::Sender<Option<Manifest>>,
    events: broadcast::Sender<ProducerEvent>,
}

impl ProducerSignals {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProducerState::Idle);
        let (snapshot, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state,
            snapshot,
            events,
        }
    }

    pub fn state(&self) -> ProducerState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ProducerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "producer state changed");
        }
    }

    pub fn publish(&self, manifest: &Manifest) {
        self.snapshot.send_replace(Some(manifest.clone()));
    }

    pub fn emit(&self, event: ProducerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn fail(&self, failure: SessionFailure) {
        self.set_state(ProducerState::Failed);
        self.emit(ProducerEvent::Failed(failure));
    }
}

enum Lifecycle {
    Idle,
    Initialized {
        handle: StreamHandle,
        manifest: Manifest,
    },
    Recording {
        handle: StreamHandle,
        cancel: CancellationToken,
        task: JoinHandle<SequencerOutcome>,
    },
    /// Drained, but the ended write has not succeeded yet.
    Closing {
        handle: StreamHandle,
        manifest: Manifest,
        abandoned: Vec<u64>,
    },
    Ended(FinalizeReport),
    Failed(SessionFailure),
}

/// One broadcast: create with [`ProducerSession::new`], then
/// [`initialize`](ProducerSession::initialize),
/// [`start_recording`](ProducerSession::start_recording), feed segments with
/// [`on_segment_ready`](ProducerSession::on_segment_ready) and finish with
/// [`finalize`](ProducerSession::finalize).
///
/// All methods take `&self`; share the session behind an `Arc` between the
/// capture path and whoever ends the broadcast.
pub struct ProducerSession {
    gateway: Arc<dyn StorageGateway>,
    config: ProducerConfig,
    signals: Arc<ProducerSignals>,
    intake: RwLock<Option<mpsc::Sender<PendingSegment>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProducerSession {
    pub fn new(gateway: Arc<dyn StorageGateway>, config: ProducerConfig) -> Self {
        Self {
            gateway,
            config,
            signals: Arc::new(ProducerSignals::new()),
            intake: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.signals.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProducerState> {
        self.signals.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.signals.events.subscribe()
    }

    /// Last manifest written to storage, if any.
    pub fn manifest(&self) -> Option<Manifest> {
        self.signals.snapshot.borrow().clone()
    }

    fn upload_policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(
            self.config.upload_backoff_base(),
            self.config.upload_backoff_max(),
        );
        match self.config.upload_attempt_limit() {
            Some(limit) => policy.with_max_attempts(limit),
            None => policy,
        }
    }

    /// Publish `manifest` and move to `Initialized`.
    ///
    /// On failure the session stays `Idle`; a retryable error may simply be
    /// tried again.
    #[tracing::instrument(skip_all, fields(stream.title = %manifest.title))]
    pub async fn initialize(
        &self,
        manifest: Manifest,
        auth: WriterAuth,
    ) -> Result<StreamHandle, StreamError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(StreamError::invalid_transition("initialize", self.state()));
        }

        match initialize_session(self.gateway.as_ref(), &manifest, auth).await {
            Ok(handle) => {
                self.signals.publish(&manifest);
                *lifecycle = Lifecycle::Initialized {
                    handle: handle.clone(),
                    manifest,
                };
                self.signals.set_state(ProducerState::Initialized);
                Ok(handle)
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(error = %err, "stream initialization failed, may retry");
                } else {
                    error!(error = %err, "stream initialization failed");
                }
                Err(err)
            }
        }
    }

    /// Spawn the upload sequencer and start accepting segments.
    pub async fn start_recording(&self) -> Result<(), StreamError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (handle, manifest) = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Initialized { handle, manifest } => (handle, manifest),
            other => {
                *lifecycle = other;
                return Err(StreamError::invalid_transition(
                    "start recording",
                    self.state(),
                ));
            }
        };

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let sequencer = UploadSequencer::new(
            self.gateway.clone(),
            handle.clone(),
            manifest,
            self.upload_policy(),
            self.signals.clone(),
        );
        let task = tokio::spawn(sequencer.run(rx, cancel.clone()));

        *self.intake.write().await = Some(tx);
        *lifecycle = Lifecycle::Recording {
            handle: handle.clone(),
            cancel,
            task,
        };
        self.signals.set_state(ProducerState::Recording);
        info!(stream.uri = %handle.manifest_uri(), "🔴 recording");
        Ok(())
    }

    /// Hand a finished segment to the sequencer.
    ///
    /// Waits if the sequencer queue is full. Capture indices start at the
    /// number of segments already in the manifest (0 for a new stream) and
    /// may arrive in any order.
    pub async fn on_segment_ready(&self, data: Bytes, capture_index: u64) -> Result<(), StreamError> {
        let sender = self.intake.read().await.clone();
        let Some(sender) = sender else {
            return Err(match self.state() {
                ProducerState::Idle | ProducerState::Initialized => {
                    StreamError::invalid_transition("enqueue a segment", self.state())
                }
                _ => StreamError::SessionClosed,
            });
        };

        let size = data.len();
        sender
            .send(PendingSegment {
                index: capture_index,
                data,
            })
            .await
            .map_err(|_| StreamError::SessionClosed)?;
        debug!(segment.index = capture_index, segment.bytes = size, "segment queued");
        Ok(())
    }

    /// Stop accepting segments, drain the queue, and mark the manifest ended.
    ///
    /// Segments still queued when the drain timeout expires are abandoned and
    /// listed in the report. Once the ended write has succeeded, further calls
    /// return the same report without touching storage.
    #[tracing::instrument(skip_all)]
    pub async fn finalize(&self) -> Result<FinalizeReport, SessionFailure> {
        let mut lifecycle = self.lifecycle.lock().await;

        let (handle, manifest, abandoned) =
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Ended(report) => {
                    *lifecycle = Lifecycle::Ended(report.clone());
                    return Ok(report);
                }
                Lifecycle::Failed(failure) => {
                    *lifecycle = Lifecycle::Failed(failure.clone());
                    return Err(failure);
                }
                Lifecycle::Idle => {
                    return Err(SessionFailure::new(
                        Component::ProducerSession,
                        None,
                        StreamError::invalid_transition("finalize", ProducerState::Idle),
                    ));
                }
                Lifecycle::Initialized { handle, manifest } => {
                    self.signals.set_state(ProducerState::Draining);
                    (handle, manifest, Vec::new())
                }
                Lifecycle::Recording {
                    handle,
                    cancel,
                    task,
                } => {
                    self.signals.set_state(ProducerState::Draining);
                    match self.drain(cancel, task).await {
                        Ok((manifest, abandoned)) => (handle, manifest, abandoned),
                        Err(failure) => {
                            *lifecycle = Lifecycle::Failed(failure.clone());
                            return Err(failure);
                        }
                    }
                }
                Lifecycle::Closing {
                    handle,
                    manifest,
                    abandoned,
                } => (handle, manifest, abandoned),
            };

        match self.write_ended(&handle, &manifest).await {
            Ok(ended) => {
                let report = FinalizeReport {
                    committed: ended.chunk_count,
                    abandoned,
                };
                self.signals.publish(&ended);
                self.signals.set_state(ProducerState::Ended);
                self.signals
                    .emit(ProducerEvent::Finalized(report.clone()));
                info!(
                    stream.uri = %handle.manifest_uri(),
                    committed = report.committed,
                    abandoned = report.abandoned.len(),
                    "⏹️ stream ended"
                );
                *lifecycle = Lifecycle::Ended(report.clone());
                Ok(report)
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "ended write failed; finalize can be retried");
                let failure = SessionFailure::new(
                    Component::ProducerSession,
                    manifest.last_index(),
                    err,
                );
                *lifecycle = Lifecycle::Closing {
                    handle,
                    manifest,
                    abandoned,
                };
                Err(failure)
            }
            Err(err) => {
                let failure = SessionFailure::new(
                    Component::ProducerSession,
                    manifest.last_index(),
                    err,
                );
                error!(error = %failure, "ended write failed");
                self.signals.fail(failure.clone());
                *lifecycle = Lifecycle::Failed(failure.clone());
                Err(failure)
            }
        }
    }

    /// Close intake and wait for the sequencer, cancelling it if the drain
    /// timeout passes. An upload already in flight is allowed to finish.
    async fn drain(
        &self,
        cancel: CancellationToken,
        mut task: JoinHandle<SequencerOutcome>,
    ) -> Result<(Manifest, Vec<u64>), SessionFailure> {
        self.intake.write().await.take();

        let timeout = self.config.drain_timeout();
        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "drain timed out; abandoning queued segments"
                );
                cancel.cancel();
                task.await
            }
        };

        let outcome = joined.map_err(|err| {
            SessionFailure::new(
                Component::UploadSequencer,
                self.manifest().and_then(|m| m.last_index()),
                StreamError::TaskFailed(err.to_string()),
            )
        })?;

        match outcome.end {
            SequencerEnd::Failed(failure) => Err(failure),
            SequencerEnd::Drained | SequencerEnd::Cancelled => {
                Ok((outcome.manifest, outcome.abandoned))
            }
        }
    }

    async fn write_ended(
        &self,
        handle: &StreamHandle,
        manifest: &Manifest,
    ) -> Result<Manifest, StreamError> {
        let mut ended = manifest.clone();
        ended.finish(now_ms()?)?;
        let bytes = ended.to_bytes()?;

        let policy = self
            .upload_policy()
            .with_max_attempts(
                self.config
                    .upload_attempt_limit()
                    .unwrap_or(FINAL_WRITE_ATTEMPTS),
            );
        let gateway = self.gateway.as_ref();

        retry(
            &policy,
            &CancellationToken::new(),
            |_| {
                let bytes = bytes.clone();
                async move {
                    gateway
                        .update_mutable(handle.manifest_uri(), bytes, handle.auth())
                        .await
                        .map_err(StreamError::from)
                }
            },
            |attempt, err, delay| {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "ended write failed, retrying"
                );
            },
        )
        .await
        .map_err(RetryError::into_error)?;

        Ok(ended)
    }
}
