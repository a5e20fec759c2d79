//! Upload sequencer - single-flight queue that commits segments to the
//! manifest in strict index order.
//!
//! Segments arrive tagged with their capture index, possibly out of order.
//! Early arrivals wait in a reorder map until their predecessors show up;
//! contiguous runs move into a FIFO queue. Only the queue head is ever being
//! committed, and a commit is `put` + append + `update_mutable` retried as a
//! unit, so the stored manifest never has a gap.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use castore::{Acl, StorageGateway};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::session::ProducerSignals;
use super::{ProducerEvent, StreamHandle};
use crate::error::{Component, SessionFailure, StreamError};
use crate::manifest::{now_ms, Manifest};
use crate::retry::{pause, retry, BackoffPolicy, RetryError};

/// A captured segment waiting to be committed.
#[derive(Debug, Clone)]
pub(crate) struct PendingSegment {
    pub index: u64,
    pub data: Bytes,
}

pub(crate) enum SequencerEnd {
    /// Intake closed and every contiguous segment was committed.
    Drained,
    Cancelled,
    Failed(SessionFailure),
}

pub(crate) struct SequencerOutcome {
    /// Last manifest successfully written.
    pub manifest: Manifest,
    /// Capture indices still queued, buffered or unread at exit.
    pub abandoned: Vec<u64>,
    pub end: SequencerEnd,
}

pub(crate) struct UploadSequencer {
    gateway: Arc<dyn StorageGateway>,
    handle: StreamHandle,
    manifest: Manifest,
    reorder: BTreeMap<u64, Bytes>,
    queue: VecDeque<PendingSegment>,
    next_index: u64,
    policy: BackoffPolicy,
    stall_pause: Duration,
    signals: Arc<ProducerSignals>,
}

impl UploadSequencer {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        handle: StreamHandle,
        manifest: Manifest,
        policy: BackoffPolicy,
        signals: Arc<ProducerSignals>,
    ) -> Self {
        let next_index = manifest.chunks.len() as u64;
        Self {
            gateway,
            handle,
            manifest,
            reorder: BTreeMap::new(),
            queue: VecDeque::new(),
            next_index,
            stall_pause: policy.max,
            policy,
            signals,
        }
    }

    /// Accept a segment. Duplicates of anything already queued or committed
    /// are dropped.
    pub fn enqueue(&mut self, segment: PendingSegment) {
        if segment.index < self.next_index || self.reorder.contains_key(&segment.index) {
            warn!(
                segment.index = segment.index,
                "duplicate capture index ignored"
            );
            return;
        }
        self.reorder.insert(segment.index, segment.data);
        while let Some(data) = self.reorder.remove(&self.next_index) {
            self.queue.push_back(PendingSegment {
                index: self.next_index,
                data,
            });
            self.next_index += 1;
        }
    }

    /// Indices waiting to be committed, queued ones first.
    pub fn pending(&self) -> Vec<u64> {
        self.queue
            .iter()
            .map(|segment| segment.index)
            .chain(self.reorder.keys().copied())
            .collect()
    }

    async fn try_commit(&self, segment: &PendingSegment) -> Result<Manifest, StreamError> {
        let uri = self
            .gateway
            .put(segment.data.clone(), Acl::ImmutablePublic)
            .await?;

        let mut candidate = self.manifest.clone();
        let appended = candidate.append(uri, now_ms()?)?;
        debug_assert_eq!(appended.index, segment.index);

        self.gateway
            .update_mutable(
                self.handle.manifest_uri(),
                candidate.to_bytes()?,
                self.handle.auth(),
            )
            .await?;
        Ok(candidate)
    }

    /// Commit the queue head, retrying per the upload policy.
    ///
    /// Returns the committed index, or `None` if nothing was queued. On
    /// any error the segment stays at the head of the queue.
    pub async fn commit_next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, RetryError> {
        let Some(segment) = self.queue.front() else {
            return Ok(None);
        };
        let index = segment.index;
        let this = &*self;

        let committed = retry(
            &this.policy,
            cancel,
            move |_| this.try_commit(segment),
            move |attempt, err, delay| {
                warn!(
                    segment.index = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "segment commit failed, retrying"
                );
                this.signals.emit(ProducerEvent::UploadRetrying {
                    index,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            },
        )
        .await?;

        self.queue.pop_front();
        let uri = committed.chunks[committed.chunks.len() - 1].uri.clone();
        self.manifest = committed;
        self.signals.publish(&self.manifest);

        info!(
            stream.uri = %self.handle.manifest_uri(),
            segment.index = index,
            segment.uri = %uri,
            "segment committed"
        );
        self.signals
            .emit(ProducerEvent::SegmentCommitted { index, uri });
        Ok(Some(index))
    }

    /// Drain `intake` until it closes, the token is cancelled or a fatal
    /// error occurs.
    #[tracing::instrument(name = "upload_sequencer", skip_all, fields(stream.uri = %self.handle.manifest_uri()))]
    pub async fn run(
        mut self,
        mut intake: mpsc::Receiver<PendingSegment>,
        cancel: CancellationToken,
    ) -> SequencerOutcome {
        loop {
            while let Ok(segment) = intake.try_recv() {
                self.enqueue(segment);
            }

            if self.queue.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.exit(intake, SequencerEnd::Cancelled),
                    received = intake.recv() => match received {
                        Some(segment) => self.enqueue(segment),
                        None => return self.exit(intake, SequencerEnd::Drained),
                    },
                }
                continue;
            }

            match self.commit_next(&cancel).await {
                Ok(_) => {}
                Err(RetryError::Cancelled) => {
                    return self.exit(intake, SequencerEnd::Cancelled);
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    let index = self.queue.front().map_or(self.next_index, |s| s.index);
                    warn!(
                        segment.index = index,
                        attempts,
                        error = %last,
                        "upload stalled; segment stays queued"
                    );
                    self.signals.emit(ProducerEvent::UploadStalled {
                        index,
                        attempts,
                        error: last.to_string(),
                    });
                    if !pause(self.stall_pause, &cancel).await {
                        return self.exit(intake, SequencerEnd::Cancelled);
                    }
                }
                Err(RetryError::Fatal(err)) => {
                    let failure = SessionFailure::new(
                        Component::UploadSequencer,
                        self.manifest.last_index(),
                        err,
                    );
                    error!(error = %failure, "upload sequencer failed");
                    if !failure.error.is_authorization() {
                        self.end_best_effort().await;
                    }
                    self.signals.fail(failure.clone());
                    return self.exit(intake, SequencerEnd::Failed(failure));
                }
            }
        }
    }

    /// One unretried attempt to mark the stream ended, so a fatal error does
    /// not leave a dangling live manifest.
    async fn end_best_effort(&mut self) {
        let mut ended = self.manifest.clone();
        let written = async {
            ended.finish(now_ms()?)?;
            self.gateway
                .update_mutable(self.handle.manifest_uri(), ended.to_bytes()?, self.handle.auth())
                .await?;
            Ok::<_, StreamError>(())
        }
        .await;

        match written {
            Ok(()) => {
                info!("manifest marked ended after failure");
                self.manifest = ended;
                self.signals.publish(&self.manifest);
            }
            Err(err) => warn!(error = %err, "could not mark manifest ended after failure"),
        }
    }

    fn exit(
        self,
        mut intake: mpsc::Receiver<PendingSegment>,
        end: SequencerEnd,
    ) -> SequencerOutcome {
        intake.close();
        let mut abandoned = self.pending();
        while let Ok(segment) = intake.try_recv() {
            abandoned.push(segment.index);
        }
        abandoned.sort_unstable();
        abandoned.dedup();

        if !abandoned.is_empty() {
            warn!(indices = ?abandoned, "segments abandoned");
            self.signals.emit(ProducerEvent::Abandoned {
                indices: abandoned.clone(),
            });
        }

        SequencerOutcome {
            manifest: self.manifest,
            abandoned,
            end,
        }
    }
}
