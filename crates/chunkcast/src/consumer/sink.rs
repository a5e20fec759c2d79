//! Decoder-feed sinks - where ordered segment bytes end up.
//!
//! A sink accepts one append at a time and reports back-pressure through
//! [`SinkError`]. The feeder never drops a payload on `CapacityExceeded` or
//! `InvalidState`; it evicts or waits and offers the same bytes again.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Internal buffer is full. Evict consumed data and retry.
    #[error("sink buffer is full")]
    CapacityExceeded,

    /// Not accepting appends right now (e.g. still initializing). Retry later.
    #[error("sink is not accepting appends")]
    InvalidState,

    /// Unrecoverable.
    #[error("sink failed: {0}")]
    Failed(String),
}

/// The byte acceptor a media decoder reads from.
#[async_trait]
pub trait DecoderSink: Send {
    /// Append one segment's bytes. Completes when the sink has taken them.
    async fn append(&mut self, data: Bytes) -> Result<(), SinkError>;

    /// Drop bytes the decoder has already consumed. Returns how many were
    /// freed; zero means nothing is evictable yet.
    async fn evict_consumed(&mut self) -> Result<usize, SinkError>;

    /// No more appends will follow.
    async fn end_of_stream(&mut self) -> Result<(), SinkError>;

    /// Largest number of bytes the sink can ever hold at once, if bounded.
    /// A payload bigger than this can never be appended.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Creates a sink for a playback session.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create_sink(&self, codec_hint: &str) -> Result<Box<dyn DecoderSink>, SinkError>;
}

#[derive(Debug)]
struct BufferState {
    segments: VecDeque<Bytes>,
    /// Bytes of `segments` already handed to the reader.
    read_offset: usize,
    buffered: usize,
    capacity: usize,
    accepting: bool,
    ended: bool,
}

impl BufferState {
    fn unread(&self) -> usize {
        self.buffered - self.read_offset
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BufferState>,
    readable: Notify,
}

/// Bounded in-memory sink. The decoder side reads through a [`SinkReader`];
/// read bytes stay buffered until the feeder evicts them.
#[derive(Debug)]
pub struct BufferedSink {
    shared: Arc<Shared>,
    capacity: usize,
}

/// Decoder side of a [`BufferedSink`].
#[derive(Debug, Clone)]
pub struct SinkReader {
    shared: Arc<Shared>,
}

impl BufferedSink {
    pub fn new(capacity: usize) -> (Self, SinkReader) {
        let shared = Arc::new(Shared {
            state: Mutex::new(BufferState {
                segments: VecDeque::new(),
                read_offset: 0,
                buffered: 0,
                capacity,
                accepting: true,
                ended: false,
            }),
            readable: Notify::new(),
        });
        (
            Self {
                shared: shared.clone(),
                capacity,
            },
            SinkReader { shared },
        )
    }
}

#[async_trait]
impl DecoderSink for BufferedSink {
    async fn append(&mut self, data: Bytes) -> Result<(), SinkError> {
        let mut state = self.shared.state.lock().await;
        if state.ended {
            return Err(SinkError::Failed("append after end of stream".to_string()));
        }
        if !state.accepting {
            return Err(SinkError::InvalidState);
        }
        if state.buffered + data.len() > state.capacity {
            return Err(SinkError::CapacityExceeded);
        }
        state.buffered += data.len();
        state.segments.push_back(data);
        drop(state);
        self.shared.readable.notify_waiters();
        Ok(())
    }

    async fn evict_consumed(&mut self) -> Result<usize, SinkError> {
        let mut state = self.shared.state.lock().await;
        let mut freed = 0;
        while let Some(front) = state.segments.front() {
            let len = front.len();
            if state.read_offset < len {
                break;
            }
            state.segments.pop_front();
            state.read_offset -= len;
            state.buffered -= len;
            freed += len;
        }
        // Partially read head segment.
        if state.read_offset > 0 {
            if let Some(front) = state.segments.pop_front() {
                let consumed = state.read_offset;
                state.segments.push_front(front.slice(consumed..));
                state.buffered -= consumed;
                state.read_offset = 0;
                freed += consumed;
            }
        }
        debug!(freed, buffered = state.buffered, "evicted consumed bytes");
        Ok(freed)
    }

    async fn end_of_stream(&mut self) -> Result<(), SinkError> {
        self.shared.state.lock().await.ended = true;
        self.shared.readable.notify_waiters();
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}

impl SinkReader {
    /// Read up to `max` unread bytes, waiting for data. `None` once the
    /// stream has ended and everything was read.
    pub async fn read(&self, max: usize) -> Option<Bytes> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock().await;
                if state.unread() > 0 {
                    return Some(Self::take(&mut state, max));
                }
                if state.ended {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Everything unread right now, without waiting.
    pub async fn read_available(&self) -> Bytes {
        let mut state = self.shared.state.lock().await;
        let unread = state.unread();
        Self::take(&mut state, unread)
    }

    fn take(state: &mut BufferState, max: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(max.min(state.unread()));
        let mut skip = state.read_offset;
        for segment in &state.segments {
            if out.len() >= max {
                break;
            }
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let available = &segment[skip..];
            skip = 0;
            let n = available.len().min(max - out.len());
            out.extend_from_slice(&available[..n]);
        }
        state.read_offset += out.len();
        out.freeze()
    }

    /// Toggle whether the sink takes appends; while off, appends fail with
    /// [`SinkError::InvalidState`].
    pub async fn set_accepting(&self, accepting: bool) {
        self.shared.state.lock().await.accepting = accepting;
    }

    pub async fn is_ended(&self) -> bool {
        self.shared.state.lock().await.ended
    }

    /// Bytes held, read or not.
    pub async fn buffered(&self) -> usize {
        self.shared.state.lock().await.buffered
    }
}

/// Factory handing out one pre-built [`BufferedSink`]. A second request fails.
pub struct BufferedSinkFactory {
    sink: std::sync::Mutex<Option<BufferedSink>>,
}

impl BufferedSinkFactory {
    pub fn new(capacity: usize) -> (Self, SinkReader) {
        let (sink, reader) = BufferedSink::new(capacity);
        (
            Self {
                sink: std::sync::Mutex::new(Some(sink)),
            },
            reader,
        )
    }
}

#[async_trait]
impl SinkFactory for BufferedSinkFactory {
    async fn create_sink(&self, codec_hint: &str) -> Result<Box<dyn DecoderSink>, SinkError> {
        let sink = self
            .sink
            .lock()
            .map_err(|_| SinkError::Failed("sink factory poisoned".to_string()))?
            .take()
            .ok_or_else(|| SinkError::Failed("buffered sink already taken".to_string()))?;
        debug!(codec = codec_hint, "buffered sink created");
        Ok(Box::new(sink))
    }
}

/// Sink that appends to a file. Never full, so eviction is a no-op.
pub struct FileSink {
    path: PathBuf,
    file: File,
    written: u64,
}

impl FileSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = File::create(&path)
            .await
            .map_err(|e| SinkError::Failed(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl DecoderSink for FileSink {
    async fn append(&mut self, data: Bytes) -> Result<(), SinkError> {
        self.file
            .write_all(&data)
            .await
            .map_err(|e| SinkError::Failed(format!("{}: {e}", self.path.display())))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn evict_consumed(&mut self) -> Result<usize, SinkError> {
        Ok(0)
    }

    async fn end_of_stream(&mut self) -> Result<(), SinkError> {
        let path = &self.path;
        let fail = |e: std::io::Error| SinkError::Failed(format!("{}: {e}", path.display()));
        self.file.flush().await.map_err(fail)?;
        self.file.sync_all().await.map_err(fail)
    }
}

pub struct FileSinkFactory {
    path: PathBuf,
}

impl FileSinkFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn create_sink(&self, codec_hint: &str) -> Result<Box<dyn DecoderSink>, SinkError> {
        debug!(codec = codec_hint, path = %self.path.display(), "file sink created");
        Ok(Box::new(FileSink::create(&self.path).await?))
    }
}
