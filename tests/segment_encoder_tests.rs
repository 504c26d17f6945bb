// Integration tests for the built-in motion-JPEG segment encoder
//
// A short real session is recorded with the segment encoder and the
// resulting artifact is decoded segment by segment.

use anyhow::Result;
use dual_recorder::capture::{SyntheticBackend, SyntheticOptions};
use dual_recorder::encoder::{read_segment, read_segments, SegmentEncoderHost, MJPEG_SEGMENT_MIME};
use dual_recorder::{CaptureMode, HostContext, Recorder, RecorderConfig, RecorderEvent, Settings};
use std::sync::Arc;
use std::time::Duration;

fn recorder() -> Recorder {
    let backend = SyntheticBackend::new(SyntheticOptions {
        camera_size: (64, 48),
        ..Default::default()
    });
    let host = HostContext::new(Arc::new(backend), Arc::new(SegmentEncoderHost))
        .with_settings(Settings::default());
    Recorder::new(host)
}

fn config(mode: CaptureMode) -> RecorderConfig {
    let mut config = RecorderConfig::new(mode);
    config.video.width = 160;
    config.video.height = 90;
    config.video.frame_rate = 10.0;
    config
}

#[tokio::test(start_paused = true)]
async fn test_recording_is_a_sequence_of_valid_segments() -> Result<()> {
    let recorder = recorder();
    let mut events = recorder.subscribe();

    recorder.start(config(CaptureMode::Combined)).await?;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let mut chunk_sizes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RecorderEvent::DataAvailable { size } = event {
            chunk_sizes.push(size);
        }
    }
    assert_eq!(chunk_sizes.len(), 2);

    let artifact = recorder.stop().await?.expect("artifact");
    assert_eq!(artifact.mime_type, MJPEG_SEGMENT_MIME);

    let segments = read_segments(&artifact.data)?;
    assert_eq!(segments.len(), artifact.chunk_count);

    // Chunks emitted while recording are the leading segments
    for (segment, size) in segments.iter().zip(&chunk_sizes) {
        assert_eq!(segment.len, *size);
    }

    for segment in &segments {
        assert_eq!((segment.width, segment.height), (160, 90));
        assert!(
            segment.frame_timestamps.windows(2).all(|w| w[0] <= w[1]),
            "frames out of order: {:?}",
            segment.frame_timestamps
        );
    }

    let first = &segments[0];
    assert!(!first.frame_timestamps.is_empty());
    assert_eq!(first.sample_rate, Some(48000));
    assert!(first.audio_samples > 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_each_chunk_decodes_on_its_own() -> Result<()> {
    let recorder = recorder();

    recorder.start(config(CaptureMode::PrimaryOnly)).await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let artifact = recorder.stop().await?.expect("artifact");

    let segments = read_segments(&artifact.data)?;
    assert!(segments.len() >= 1);

    // Skip the first segment entirely and decode the rest from its end
    let offset = segments[0].len;
    if offset < artifact.data.len() {
        let second = read_segment(&artifact.data[offset..])?;
        assert_eq!(second, segments[1]);
    }
    Ok(())
}

#[test]
fn test_truncated_segment_is_rejected() {
    assert!(read_segment(b"DRSG").is_err());
    assert!(read_segment(b"not a segment at all").is_err());
}
