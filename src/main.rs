use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dual_recorder::encoder::{ByteCount, SegmentEncoderHost};
use dual_recorder::{
    CaptureMode, HostContext, IsolatedDevice, Recorder, RecorderConfig, RecorderEvent, Settings,
    SyntheticBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Primary,
    Secondary,
    Combined,
}

impl From<Mode> for CaptureMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Primary => CaptureMode::PrimaryOnly,
            Mode::Secondary => CaptureMode::SecondaryOnly,
            Mode::Combined => CaptureMode::Combined,
        }
    }
}

#[derive(Parser)]
#[command(name = "dual-recorder")]
#[command(about = "Record a display and camera pair into one file")]
struct Args {
    /// Duration to record in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Sources to record
    #[arg(short, long, value_enum, default_value = "combined")]
    mode: Mode,

    #[arg(long, default_value = "1280")]
    width: u32,

    #[arg(long, default_value = "720")]
    height: u32,

    #[arg(long, default_value = "30")]
    fps: f64,

    /// Video bitrate in bits per second
    #[arg(long, default_value = "5000000")]
    video_bitrate: u32,

    /// Always use the software compositor
    #[arg(long)]
    no_accel: bool,

    /// Settings file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Where to write the recording
    #[arg(short, long, default_value = "recording.mjpg")]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dual_recorder=info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()));
    let mut settings = Settings::load(config_path.as_deref())?;
    if args.no_accel {
        settings.compositor.accelerated = false;
    }

    let output = PathBuf::from(shellexpand::tilde(&args.output).as_ref());

    info!("Dual Recorder v{}", env!("CARGO_PKG_VERSION"));
    info!("Recording {:?} for {} seconds", args.mode, args.duration);

    let host = HostContext::new(Arc::new(SyntheticBackend::default()), Arc::new(SegmentEncoderHost))
        .with_accelerator(Arc::new(IsolatedDevice))
        .with_settings(settings);
    let recorder = Recorder::new(host);

    let mut config = RecorderConfig::new(args.mode.into());
    config.video.width = args.width;
    config.video.height = args.height;
    config.video.frame_rate = args.fps;
    config.bitrate.video = args.video_bitrate;

    let mut events = recorder.subscribe();
    let event_log = tokio::spawn(async move {
        let mut total = 0usize;
        loop {
            match events.recv().await {
                Ok(RecorderEvent::DataAvailable { size }) => {
                    total += size;
                    info!("Chunk ready: {} ({} so far)", ByteCount(size), ByteCount(total));
                }
                Ok(RecorderEvent::Error { code, message }) => {
                    error!("Recorder error [{}]: {}", code, message)
                }
                Ok(RecorderEvent::CompositorFallback { reason }) => {
                    warn!("Compositor fell back to software: {}", reason)
                }
                Ok(RecorderEvent::StateChanged { state }) => info!("State: {}", state),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    recorder
        .start(config)
        .await
        .context("Failed to start recording")?;

    info!("Recording started! Press Ctrl+C to stop early, or wait {} seconds", args.duration);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    info!("Stopping recording...");
    let artifact = recorder.stop().await.context("Failed to stop recording")?;
    drop(recorder);
    event_log.abort();

    match artifact {
        Some(artifact) if !artifact.is_empty() => {
            tokio::fs::write(&output, &artifact.data)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Recording complete!");
            info!(
                "Saved {} ({}, {} chunks, {:.1}s) to {}",
                artifact.mime_type,
                ByteCount(artifact.size()),
                artifact.chunk_count,
                artifact.duration.as_secs_f64(),
                output.display()
            );
            if artifact.evicted_chunks > 0 {
                warn!("{} early chunks were dropped to stay within memory", artifact.evicted_chunks);
            }
        }
        _ => warn!("No data captured, nothing written"),
    }

    Ok(())
}
