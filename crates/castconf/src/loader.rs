//! Config file discovery, layered merging, and environment variable overlay.

use crate::{CastConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only existing files
/// are returned.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/chunkcast/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("chunkcast/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("chunkcast.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read one config file as a raw TOML table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`. Keys present in `overlay` win; nested
/// tables are merged key by key so a later file can override one field of a
/// section without restating the rest.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Turn a merged table into a config, filling in defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<CastConfig, ConfigError> {
    let mut config: CastConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
    config.paths.store_dir = expand_path(&config.paths.store_dir.to_string_lossy());
    Ok(config)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut CastConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup (the environment, in production).
///
/// Unparseable numeric values are ignored rather than failing the load.
pub fn apply_overrides_from<F>(config: &mut CastConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("CHUNKCAST_STORE_DIR") {
        config.paths.store_dir = expand_path(&v);
        sources.env_overrides.push("CHUNKCAST_STORE_DIR".to_string());
    }

    if let Some(v) = lookup("CHUNKCAST_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("CHUNKCAST_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Some(ms) = lookup("CHUNKCAST_SEGMENT_DURATION_MS").and_then(|v| v.parse().ok()) {
        config.producer.segment_duration_ms = ms;
        sources
            .env_overrides
            .push("CHUNKCAST_SEGMENT_DURATION_MS".to_string());
    }
    if let Some(ms) = lookup("CHUNKCAST_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.consumer.poll_interval_ms = ms;
        sources
            .env_overrides
            .push("CHUNKCAST_POLL_INTERVAL_MS".to_string());
    }
    if let Some(k) = lookup("CHUNKCAST_BOOTSTRAP_SEGMENTS").and_then(|v| v.parse().ok()) {
        config.consumer.bootstrap_segments = k;
        sources
            .env_overrides
            .push("CHUNKCAST_BOOTSTRAP_SEGMENTS".to_string());
    }
    if let Some(depth) = lookup("CHUNKCAST_PREFETCH_DEPTH").and_then(|v| v.parse().ok()) {
        config.consumer.prefetch_depth = depth;
        sources
            .env_overrides
            .push("CHUNKCAST_PREFETCH_DEPTH".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        match directories::BaseDirs::new() {
            Some(base) => base.home_dir().join(stripped),
            None => PathBuf::from(path),
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR or $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], Some(&stripped[pos + 1..])),
            None => (stripped, None),
        };
        match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    }
}
