//! Tracing subscriber setup for the `chunkcast` binary.
//!
//! Logs go to stderr so `inspect`/`config` output and a `watch` piped to
//! stdout stay clean.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter from a directive string such as `info` or
/// `chunkcast=debug,castore=info`.
pub fn filter(log_level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(log_level).with_context(|| format!("Invalid log filter: {log_level}"))
}

/// Install the global subscriber. `log_level` already reflects `RUST_LOG`
/// when it is set.
pub fn init(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(log_level)?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to initialize tracing")?;

    tracing::debug!(log_level, "📜 tracing initialized");
    Ok(())
}
