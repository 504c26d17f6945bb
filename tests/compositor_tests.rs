// Integration tests for the video compositor
//
// These tests drive the compositor with synthetic display and camera
// sources and check variant selection, fallback and buffer ownership.

use anyhow::Result;
use async_trait::async_trait;
use dual_recorder::capture::{CaptureBackend, Constraints, SyntheticBackend, SyntheticOptions};
use dual_recorder::compositor::{
    AccelerationDevice, Compositor, CompositorConfig, CompositorVariant, FallbackHook,
    IsolatedDevice,
};
use dual_recorder::error::CompositionError;
use dual_recorder::media::{MediaStream, Origin, Track, TrackSettings, TrackSink, VideoFrame};
use image::RgbaImage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 180;

fn backend() -> SyntheticBackend {
    SyntheticBackend::new(SyntheticOptions {
        camera_size: (160, 120),
        ..Default::default()
    })
}

async fn acquire_pair(backend: &SyntheticBackend) -> Result<(MediaStream, MediaStream)> {
    let constraints = Constraints {
        width: WIDTH,
        height: HEIGHT,
        frame_rate: 30.0,
        audio: false,
        device_id: None,
    };
    let primary = backend.acquire(Origin::Primary, &constraints).await?;
    let secondary = backend.acquire(Origin::Secondary, &constraints).await?;
    Ok((primary, secondary))
}

fn video(stream: &MediaStream) -> Track {
    stream.video_track().cloned().expect("stream has a video track")
}

fn recording_hook() -> (FallbackHook, Arc<Mutex<Vec<CompositionError>>>) {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    let hook: FallbackHook = Arc::new(move |reason: &CompositionError| {
        sink.lock().unwrap().push(reason.clone());
    });
    (hook, reasons)
}

/// Read composed frames until the track ends, counting them
fn drain(track: &Track) -> JoinHandle<u64> {
    let track = track.clone();
    tokio::spawn(async move {
        let Some(mut reader) = track.video_reader().await else {
            return 0;
        };
        let mut frames = 0;
        while let Some(frame) = reader.read().await {
            assert_eq!((frame.width(), frame.height()), (WIDTH, HEIGHT));
            frames += 1;
        }
        frames
    })
}

/// Never finishes preparing
struct StalledDevice;

#[async_trait]
impl AccelerationDevice for StalledDevice {
    fn name(&self) -> &str {
        "stalled"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn prepare(&self, _width: u32, _height: u32) -> Result<(), CompositionError> {
        std::future::pending().await
    }
}

/// Fails once a few frames have been submitted
struct FailingDevice {
    fail_at: u64,
}

#[async_trait]
impl AccelerationDevice for FailingDevice {
    fn name(&self) -> &str {
        "failing"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn prepare(&self, _width: u32, _height: u32) -> Result<(), CompositionError> {
        Ok(())
    }

    fn submit(&self, frame_index: u64) -> Result<(), CompositionError> {
        if frame_index >= self.fail_at {
            return Err(CompositionError::Device("context lost".to_string()));
        }
        Ok(())
    }
}

/// Fails its capability probe
struct MissingDevice;

#[async_trait]
impl AccelerationDevice for MissingDevice {
    fn name(&self) -> &str {
        "missing"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn prepare(&self, _width: u32, _height: u32) -> Result<(), CompositionError> {
        Ok(())
    }
}

/// Hand-fed video input whose pool has room for several frames
fn fed_input(origin: Origin, width: u32, height: u32) -> (Track, TrackSink<VideoFrame>) {
    Track::video(origin, "Fed", TrackSettings::video(width, height, 30.0), 3)
}

fn feed(sink: &TrackSink<VideoFrame>, width: u32, height: u32) {
    let slot = sink
        .pool()
        .and_then(|pool| pool.try_acquire())
        .expect("input pool has a free buffer");
    let frame = VideoFrame::pooled(RgbaImage::new(width, height), None, slot);
    assert!(sink.try_send(frame), "input queue has room");
}

#[tokio::test(start_paused = true)]
async fn test_accelerated_holds_one_buffer_per_input() -> Result<()> {
    let (primary, primary_sink) = fed_input(Origin::Primary, WIDTH, HEIGHT);
    let (secondary, secondary_sink) = fed_input(Origin::Secondary, 160, 120);
    let (hook, reasons) = recording_hook();

    let mut compositor = Compositor::start(
        &primary,
        &secondary,
        CompositorConfig::new(WIDTH, HEIGHT, 30.0),
        Some(Arc::new(IsolatedDevice)),
        hook,
    )
    .await?;
    assert_eq!(compositor.variant(), CompositorVariant::Accelerated);

    let pools = [
        primary.frame_pool().expect("primary pool"),
        secondary.frame_pool().expect("secondary pool"),
    ];
    let output = compositor.output().clone();
    let mut reader = output.video_reader().await.expect("composed video");

    feed(&primary_sink, WIDTH, HEIGHT);
    feed(&secondary_sink, 160, 120);
    for _ in 0..10 {
        // Keep one frame queued ahead of the compositor on each input
        feed(&primary_sink, WIDTH, HEIGHT);
        feed(&secondary_sink, 160, 120);

        let frame = reader.read().await.expect("composed frame");
        assert_eq!(frame.width(), WIDTH);
        drop(frame);

        // Between output frames only the queued frame is alive; the one
        // just composed has already gone back to its pool
        tokio::time::sleep(Duration::from_millis(1)).await;
        for pool in &pools {
            assert_eq!(pool.live(), 1, "compositor kept a buffer: {:?}", pool);
        }
    }
    drop(reader);

    for pool in &pools {
        assert_eq!(pool.peak(), 2, "{:?}", pool);
    }
    assert!(reasons.lock().unwrap().is_empty());

    assert!(compositor.stop());
    assert!(!compositor.stop(), "second stop should be a no-op");
    assert!(output.is_released());

    primary.stop();
    secondary.stop();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ready_timeout_falls_back_to_software() -> Result<()> {
    let backend = backend();
    let (primary, secondary) = acquire_pair(&backend).await?;
    let (hook, reasons) = recording_hook();

    let started = tokio::time::Instant::now();
    let mut compositor = Compositor::start(
        &video(&primary),
        &video(&secondary),
        CompositorConfig::new(WIDTH, HEIGHT, 30.0),
        Some(Arc::new(StalledDevice)),
        hook,
    )
    .await?;

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(compositor.variant(), CompositorVariant::Software);
    assert_eq!(
        reasons.lock().unwrap().as_slice(),
        &[CompositionError::ReadyTimeout(Duration::from_secs(5))]
    );

    // The software path still produces a combined stream
    let mut reader = compositor.output().video_reader().await.expect("composed video");
    let frame = reader.read().await.expect("composed frame");
    assert_eq!((frame.width(), frame.height()), (WIDTH, HEIGHT));
    drop(frame);
    drop(reader);

    compositor.stop();
    assert_eq!(primary.stop_all() + secondary.stop_all(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_runtime_failure_restarts_in_software() -> Result<()> {
    let backend = backend();
    let (primary, secondary) = acquire_pair(&backend).await?;
    let (hook, reasons) = recording_hook();

    let mut compositor = Compositor::start(
        &video(&primary),
        &video(&secondary),
        CompositorConfig::new(WIDTH, HEIGHT, 30.0),
        Some(Arc::new(FailingDevice { fail_at: 3 })),
        hook,
    )
    .await?;
    assert_eq!(compositor.variant(), CompositorVariant::Accelerated);

    let drained = drain(compositor.output());
    let mut variant = compositor.watch_variant();
    tokio::time::timeout(
        Duration::from_secs(10),
        variant.wait_for(|v| *v == CompositorVariant::Software),
    )
    .await??;

    assert_eq!(
        reasons.lock().unwrap().as_slice(),
        &[CompositionError::Device("context lost".to_string())]
    );

    // Frames keep coming from the software variant
    tokio::time::sleep(Duration::from_millis(500)).await;
    compositor.stop();
    let frames = drained.await?;
    assert!(frames > 3, "expected frames after the fallback, got {}", frames);

    primary.stop_all();
    secondary.stop_all();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_device_uses_software() -> Result<()> {
    let backend = backend();
    let (primary, secondary) = acquire_pair(&backend).await?;
    let (hook, reasons) = recording_hook();

    let mut compositor = Compositor::start(
        &video(&primary),
        &video(&secondary),
        CompositorConfig::new(WIDTH, HEIGHT, 30.0),
        Some(Arc::new(MissingDevice)),
        hook,
    )
    .await?;

    assert_eq!(compositor.variant(), CompositorVariant::Software);
    assert!(reasons.lock().unwrap().is_empty(), "no probe is not a fallback");

    compositor.stop();
    primary.stop_all();
    secondary.stop_all();
    Ok(())
}

#[tokio::test]
async fn test_rejects_non_video_inputs() -> Result<()> {
    let backend = backend();
    let constraints = Constraints {
        width: WIDTH,
        height: HEIGHT,
        frame_rate: 30.0,
        audio: true,
        device_id: None,
    };
    let primary = backend.acquire(Origin::Primary, &constraints).await?;
    let audio = primary.audio_track().cloned().expect("audio track");
    let (hook, _) = recording_hook();

    let result = Compositor::start(
        &video(&primary),
        &audio,
        CompositorConfig::new(WIDTH, HEIGHT, 30.0),
        None,
        hook,
    )
    .await;
    assert!(matches!(result, Err(CompositionError::Input(_))));

    primary.stop_all();
    Ok(())
}
