//! Configuration sections and their compiled defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Filesystem paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the filesystem storage gateway.
    /// Default: ~/.chunkcast/store
    #[serde(default = "PathsConfig::default_store_dir")]
    pub store_dir: PathBuf,
}

impl PathsConfig {
    fn default_store_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".chunkcast/store"))
            .unwrap_or_else(|| PathBuf::from(".chunkcast/store"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store_dir: Self::default_store_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Broadcast side: segmentation and upload sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Length of one media segment.
    pub segment_duration_ms: u64,

    /// A segment is cut early once this many bytes are buffered.
    pub max_segment_bytes: usize,

    /// First retry delay for a failed upload+append.
    pub upload_backoff_base_ms: u64,

    /// Cap on the exponential upload backoff.
    pub upload_backoff_max_ms: u64,

    /// Attempts per retry round before the sequencer reports a stall.
    /// 0 means keep retrying within a single round.
    pub upload_max_attempts: u32,

    /// How long finalize waits for queued segments before abandoning them.
    pub drain_timeout_ms: u64,

    /// Bound on segments waiting to enter the sequencer.
    pub queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            segment_duration_ms: 30_000,
            max_segment_bytes: 8 * 1024 * 1024,
            upload_backoff_base_ms: 1_000,
            upload_backoff_max_ms: 5_000,
            upload_max_attempts: 0,
            drain_timeout_ms: 60_000,
            queue_capacity: 64,
        }
    }
}

impl ProducerConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn upload_backoff_base(&self) -> Duration {
        Duration::from_millis(self.upload_backoff_base_ms)
    }

    pub fn upload_backoff_max(&self) -> Duration {
        Duration::from_millis(self.upload_backoff_max_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// `None` when attempts are unlimited.
    pub fn upload_attempt_limit(&self) -> Option<u32> {
        (self.upload_max_attempts > 0).then_some(self.upload_max_attempts)
    }
}

/// Playback side: polling, fetching and sink feeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Interval between manifest polls.
    pub poll_interval_ms: u64,

    /// Segments appended before playback is signalled ready.
    pub bootstrap_segments: usize,

    /// Segments fetched ahead of the next in-order append.
    pub prefetch_depth: usize,

    /// Fetch attempts per segment before it is marked lost.
    pub fetch_max_attempts: u32,

    pub fetch_backoff_base_ms: u64,

    pub fetch_backoff_max_ms: u64,

    /// Manifest read attempts per poll. Exhausting them fails the initial
    /// load; a live poll just waits for the next interval.
    pub manifest_max_attempts: u32,

    /// Delay before re-offering a payload the sink refused as not ready.
    pub sink_retry_delay_ms: u64,

    /// Capacity of the in-memory decoder buffer.
    pub sink_capacity_bytes: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            bootstrap_segments: 2,
            prefetch_depth: 2,
            fetch_max_attempts: 5,
            fetch_backoff_base_ms: 500,
            fetch_backoff_max_ms: 5_000,
            manifest_max_attempts: 5,
            sink_retry_delay_ms: 250,
            sink_capacity_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_backoff_base(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_base_ms)
    }

    pub fn fetch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_max_ms)
    }

    pub fn sink_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sink_retry_delay_ms)
    }
}
