//! chunkcast - broadcast and watch chunked live streams
//!
//! Subcommands:
//! - `chunkcast broadcast` - Segment a byte source and publish it as a live stream
//! - `chunkcast watch <manifest>` - Play a stream into a file or stdout
//! - `chunkcast inspect <manifest>` - Print and validate a manifest
//! - `chunkcast resolve <uri>` - Print the URL behind an object URI
//! - `chunkcast config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use castconf::CastConfig;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "chunkcast")]
#[command(about = "Chunked live streams over content-addressed storage")]
#[command(version)]
struct Cli {
    /// Config file to load instead of ./chunkcast.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides paths.store_dir)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a live stream from a byte source
    Broadcast {
        /// Stream title
        #[arg(short, long)]
        title: String,

        /// Creator identity; the only writer allowed to update the manifest
        #[arg(long)]
        creator: String,

        /// Encoded media to read, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Segment duration in milliseconds (overrides producer.segment_duration_ms)
        #[arg(long)]
        segment_ms: Option<u64>,
    },

    /// Play a stream until it ends
    Watch {
        /// Manifest URI (doc://…)
        manifest: String,

        /// Write the stream here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Codec hint passed to the decoder sink
        #[arg(long, default_value = "application/octet-stream")]
        codec: String,
    },

    /// Print a manifest and check its invariants
    Inspect {
        /// Manifest URI (doc://…)
        manifest: String,
    },

    /// Print the URL a generic transport can fetch an object from
    Resolve {
        /// Object URI (cas://… or doc://…)
        uri: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = CastConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    chunkcast::telemetry::init(&config.telemetry.log_level)?;

    let store = cli
        .store
        .clone()
        .unwrap_or_else(|| config.paths.store_dir.clone());

    match cli.command {
        Commands::Broadcast {
            title,
            creator,
            input,
            segment_ms,
        } => {
            commands::broadcast(
                &config,
                &store,
                commands::BroadcastArgs {
                    title,
                    creator,
                    input,
                    segment_ms,
                },
            )
            .await?;
        }
        Commands::Watch {
            manifest,
            output,
            codec,
        } => {
            commands::watch(
                &config,
                &store,
                commands::WatchArgs {
                    manifest,
                    output,
                    codec,
                },
            )
            .await?;
        }
        Commands::Inspect { manifest } => {
            commands::inspect(&store, &manifest).await?;
        }
        Commands::Resolve { uri } => {
            commands::resolve(&store, &uri).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &sources)?;
        }
    }

    Ok(())
}
