//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use castconf::{CastConfig, ConfigSources};
use castore::{FileGateway, ObjectUri, StorageGateway, WriterAuth};
use chrono::{DateTime, Utc};
use chunkcast::consumer::{BufferedSinkFactory, FileSinkFactory, SinkFactory, SinkReader};
use chunkcast::{Manifest, PlaybackSession, PlaybackState, ProducerSession, Segmenter};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Largest read handed to stdout in one go when watching without `--output`.
const STDOUT_CHUNK: usize = 64 * 1024;

fn open_gateway(store: &Path) -> Result<Arc<FileGateway>> {
    let gateway = FileGateway::at_path(store)
        .with_context(|| format!("Failed to open store at {}", store.display()))?;
    Ok(Arc::new(gateway))
}

/// Viewers never write, so they open the store read-only.
fn open_viewer_gateway(store: &Path) -> Result<Arc<FileGateway>> {
    let gateway = FileGateway::read_only_at(store)
        .with_context(|| format!("Failed to open store at {}", store.display()))?;
    Ok(Arc::new(gateway))
}

fn parse_uri(uri: &str) -> Result<ObjectUri> {
    uri.parse()
        .with_context(|| format!("Invalid object URI: '{uri}' (expected cas://… or doc://…)"))
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| format!("{ms} (out of range)"))
}

pub struct BroadcastArgs {
    pub title: String,
    pub creator: String,
    pub input: String,
    pub segment_ms: Option<u64>,
}

/// Publish a new stream and upload `input` as it is read. Finalizes at end
/// of input or on Ctrl-C.
pub async fn broadcast(config: &CastConfig, store: &Path, args: BroadcastArgs) -> Result<()> {
    let gateway = open_gateway(store)?;
    let mut producer_config = config.producer.clone();
    if let Some(ms) = args.segment_ms {
        if ms == 0 {
            bail!("--segment-ms must be positive");
        }
        producer_config.segment_duration_ms = ms;
    }

    let source: Box<dyn AsyncRead + Unpin + Send> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&args.input)
                .await
                .with_context(|| format!("Failed to open input {}", args.input))?,
        )
    };

    let session = ProducerSession::new(gateway, producer_config.clone());
    let manifest = Manifest::new(args.title, args.creator.as_str())?;
    let handle = session
        .initialize(manifest, WriterAuth::new(args.creator.as_str()))
        .await
        .context("Failed to publish stream manifest")?;
    println!("{}", handle.manifest_uri());

    session.start_recording().await?;

    let mut segmenter = Segmenter::from_config(&producer_config);
    tokio::select! {
        result = segmenter.run(source, &session) => {
            let emitted = result.context("Capture failed")?;
            tracing::info!(segments = emitted, "input finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(
                next_index = segmenter.next_index(),
                pending_bytes = segmenter.pending_bytes(),
                "interrupted, finalizing"
            );
            segmenter
                .flush(&session)
                .await
                .context("Failed to hand over the last segment")?;
        }
    }

    let report = session.finalize().await?;
    if !report.abandoned.is_empty() {
        eprintln!(
            "warning: {} segment(s) were not committed: {:?}",
            report.abandoned.len(),
            report.abandoned
        );
    }
    eprintln!("stream ended with {} segment(s)", report.committed);
    Ok(())
}

pub struct WatchArgs {
    pub manifest: String,
    pub output: Option<PathBuf>,
    pub codec: String,
}

/// Play a stream into `output`, or to stdout when no file is given.
pub async fn watch(config: &CastConfig, store: &Path, args: WatchArgs) -> Result<()> {
    let gateway = open_viewer_gateway(store)?;
    let uri = parse_uri(&args.manifest)?;

    let (sinks, reader): (Arc<dyn SinkFactory>, Option<SinkReader>) = match &args.output {
        Some(path) => (Arc::new(FileSinkFactory::new(path)), None),
        None => {
            let (factory, reader) = BufferedSinkFactory::new(config.consumer.sink_capacity_bytes);
            (Arc::new(factory), Some(reader))
        }
    };
    let pump = reader.map(|reader| tokio::spawn(pump_stdout(reader)));

    let handle = PlaybackSession::new(gateway, sinks, config.consumer.clone())
        .with_codec_hint(args.codec)
        .start(uri);

    let outcome = tokio::select! {
        outcome = handle.join() => outcome,
        _ = tokio::signal::ctrl_c() => handle.stop().await,
    };

    let state = outcome?;
    if let Some(pump) = pump {
        if state == PlaybackState::Ended {
            pump.await.context("stdout writer panicked")??;
        } else {
            pump.abort();
        }
    }
    eprintln!("playback {state}");
    Ok(())
}

async fn pump_stdout(reader: SinkReader) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = reader.read(STDOUT_CHUNK).await {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Print a manifest and whether it holds up.
pub async fn inspect(store: &Path, manifest: &str) -> Result<()> {
    let gateway = open_viewer_gateway(store)?;
    let uri = parse_uri(manifest)?;
    let data = gateway.get(&uri).await?;
    let manifest = Manifest::parse(&data)?;

    println!("{}", serde_json::to_string_pretty(&manifest)?);
    println!();
    println!("title:    {}", manifest.title);
    println!("creator:  {}", manifest.creator);
    println!("status:   {:?}", manifest.status);
    println!("started:  {}", format_ms(manifest.started_at));
    if let Some(ended_at) = manifest.ended_at {
        println!("ended:    {}", format_ms(ended_at));
    }
    println!("segments: {}", manifest.chunks.len());
    match manifest.validate() {
        Ok(()) => println!("valid:    yes"),
        Err(err) => println!("valid:    no ({err})"),
    }
    Ok(())
}

pub async fn resolve(store: &Path, uri: &str) -> Result<()> {
    let gateway = open_viewer_gateway(store)?;
    let url = gateway.resolve(&parse_uri(uri)?).await?;
    println!("{url}");
    Ok(())
}

pub fn show_config(config: &CastConfig, sources: &ConfigSources) -> Result<()> {
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {var}");
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
