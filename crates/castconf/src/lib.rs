//! Layered configuration loading for chunkcast.
//!
//! Every chunkcast binary and library reads its tunables through this crate,
//! so it stays small: serde, toml and directories.
//!
//! # Usage
//!
//! ```rust,no_run
//! use castconf::CastConfig;
//!
//! let config = CastConfig::load().expect("Failed to load config");
//!
//! println!("store: {}", config.paths.store_dir.display());
//! println!("segment every {:?}", config.producer.segment_duration());
//! println!("poll every {:?}", config.consumer.poll_interval());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/chunkcast/config.toml` (system)
//! 2. `~/.config/chunkcast/config.toml` (user)
//! 3. `./chunkcast.toml` or the `--config` path (local override)
//! 4. Environment variables (`CHUNKCAST_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! store_dir = "~/.chunkcast/store"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [producer]
//! segment_duration_ms = 30000
//! upload_backoff_base_ms = 1000
//! upload_backoff_max_ms = 5000
//!
//! [consumer]
//! poll_interval_ms = 3000
//! bootstrap_segments = 2
//! prefetch_depth = 2
//! ```

pub mod loader;
pub mod settings;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use settings::{ConsumerConfig, PathsConfig, ProducerConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to render configuration: {0}")]
    Render(String),
}

/// Complete chunkcast configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CastConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl CastConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/chunkcast/config.toml`
    /// 3. `~/.config/chunkcast/config.toml`
    /// 4. `./chunkcast.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of
    /// `./chunkcast.toml`. System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.producer.segment_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "producer.segment_duration_ms must be positive".to_string(),
            ));
        }
        if self.producer.max_segment_bytes == 0 {
            return Err(ConfigError::Invalid(
                "producer.max_segment_bytes must be positive".to_string(),
            ));
        }
        if self.producer.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "producer.queue_capacity must be positive".to_string(),
            ));
        }
        if self.producer.upload_backoff_base_ms > self.producer.upload_backoff_max_ms {
            return Err(ConfigError::Invalid(
                "producer.upload_backoff_base_ms exceeds upload_backoff_max_ms".to_string(),
            ));
        }
        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.consumer.bootstrap_segments == 0 {
            return Err(ConfigError::Invalid(
                "consumer.bootstrap_segments must be at least 1".to_string(),
            ));
        }
        if self.consumer.prefetch_depth == 0 {
            return Err(ConfigError::Invalid(
                "consumer.prefetch_depth must be at least 1".to_string(),
            ));
        }
        if self.consumer.fetch_max_attempts == 0 || self.consumer.manifest_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "consumer fetch and manifest attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize config to a TOML string with a header comment.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;
        Ok(format!("# chunkcast configuration\n\n{body}"))
    }
}
