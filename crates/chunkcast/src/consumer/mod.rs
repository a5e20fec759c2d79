//! Playback side: manifest polling, ordered segment feeding and the playback
//! session lifecycle.

pub mod feeder;
pub mod poller;
pub mod session;
pub mod sink;

use std::fmt;

use crate::error::SessionFailure;

pub use feeder::{FeedReport, FeederConfig, SegmentFeeder};
pub use poller::{ManifestPoller, PollOutcome};
pub use session::{PlaybackHandle, PlaybackSession};
pub use sink::{
    BufferedSink, BufferedSinkFactory, DecoderSink, FileSink, FileSinkFactory, SinkError,
    SinkFactory, SinkReader,
};

/// Playback lifecycle.
///
/// `Unloaded → Loading → Bootstrapping → Live → Ended`. `Error` is reachable
/// from any non-terminal state and is never left. `Stopped` means the
/// session was stopped before the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Unloaded,
    Loading,
    Bootstrapping,
    Live,
    Ended,
    Stopped,
    Error,
}

impl PlaybackState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlaybackState::Ended | PlaybackState::Stopped | PlaybackState::Error
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Unloaded => "unloaded",
            PlaybackState::Loading => "loading",
            PlaybackState::Bootstrapping => "bootstrapping",
            PlaybackState::Live => "live",
            PlaybackState::Ended => "ended",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Bootstrap finished; `applied` segments are already in the sink.
    Ready { applied: usize },
    SegmentApplied { index: u64, bytes: usize },
    /// Fetch retries ran out; playback continues past the gap.
    SegmentLost {
        index: u64,
        attempts: u32,
        error: String,
    },
    EndOfStream { last_index: Option<u64> },
    Failed(SessionFailure),
}
