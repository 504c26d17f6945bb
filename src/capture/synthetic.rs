// Synthetic capture backend
//
// Generates a moving test pattern for video and a sine tone for audio, so
// the whole pipeline can run without real devices. Failures (permission
// denial, missing devices, external revocation) can be injected.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::collections::HashSet;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::backend::{CaptureBackend, Constraints};
use crate::error::AcquisitionError;
use crate::media::{
    AudioFrame, MediaStream, Origin, Track, TrackEnd, TrackSettings, TrackSink, VideoFrame,
};

/// Configuration for the synthetic backend
#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    /// Origins this backend can capture
    pub supported: HashSet<Origin>,
    /// Origins whose permission prompt is refused
    pub denied: HashSet<Origin>,
    /// Origins with no device attached
    pub unavailable: HashSet<Origin>,
    /// Simulated time to open a device
    pub acquire_delay: Duration,
    /// Native resolution of the camera (secondary) source
    pub camera_size: (u32, u32),
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Audio channels
    pub channels: u16,
    /// Duration of each audio frame in milliseconds
    pub audio_frame_ms: u64,
    /// Video buffers a source may hold at once
    pub video_pool_capacity: usize,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            supported: [Origin::Primary, Origin::Secondary].into_iter().collect(),
            denied: HashSet::new(),
            unavailable: HashSet::new(),
            acquire_delay: Duration::ZERO,
            camera_size: (640, 480),
            sample_rate: 48000,
            channels: 1,
            audio_frame_ms: 20,
            video_pool_capacity: 1,
        }
    }
}

/// Capture backend producing generated media
pub struct SyntheticBackend {
    options: SyntheticOptions,
    live: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
    revoke_tx: broadcast::Sender<Origin>,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        let (revoke_tx, _) = broadcast::channel(8);
        Self {
            options,
            live: Arc::new(AtomicUsize::new(0)),
            acquired: Arc::new(AtomicUsize::new(0)),
            revoke_tx,
        }
    }

    pub fn options(&self) -> &SyntheticOptions {
        &self.options
    }

    /// Tracks handed out and not yet released
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Tracks handed out since creation
    pub fn total_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// End every live video track of `origin` as if the user had stopped
    /// sharing it
    pub fn revoke(&self, origin: Origin) {
        info!("Simulating external revocation of the {} source", origin);
        let _ = self.revoke_tx.send(origin);
    }

    fn register(&self, track: &Track) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live);
        track.on_release(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn spawn_video(&self, origin: Origin, constraints: &Constraints) -> Track {
        let (width, height) = match origin {
            Origin::Secondary => self.options.camera_size,
            _ => (constraints.width, constraints.height),
        };
        let settings = TrackSettings::video(width, height, constraints.frame_rate)
            .with_device(constraints.device_id.clone());
        let label = match origin {
            Origin::Secondary => "Synthetic Camera",
            _ => "Synthetic Display",
        };

        let (track, sink) = Track::video(origin, label, settings, self.options.video_pool_capacity);
        self.register(&track);

        let revoke_rx = self.revoke_tx.subscribe();
        tokio::spawn(watch_revocation(sink.clone(), origin, revoke_rx));
        tokio::spawn(produce_video(sink, width, height, constraints.frame_rate, origin));

        track
    }

    fn spawn_audio(&self, origin: Origin) -> Track {
        let frames_per_sec = (1000 / self.options.audio_frame_ms.max(1)).max(1) as usize;
        let settings = TrackSettings::audio(self.options.sample_rate, self.options.channels);
        let label = match origin {
            Origin::Secondary => "Synthetic Microphone",
            _ => "Synthetic System Audio",
        };

        let (track, sink) = Track::audio(origin, label, settings, frames_per_sec);
        self.register(&track);

        let tone_hz = match origin {
            Origin::Secondary => 660.0,
            _ => 440.0,
        };
        tokio::spawn(produce_audio(
            sink,
            self.options.sample_rate,
            self.options.channels,
            self.options.audio_frame_ms,
            tone_hz,
            origin,
        ));

        track
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticOptions::default())
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn acquire(
        &self,
        origin: Origin,
        constraints: &Constraints,
    ) -> Result<MediaStream, AcquisitionError> {
        if !self.options.acquire_delay.is_zero() {
            tokio::time::sleep(self.options.acquire_delay).await;
        }

        if self.options.denied.contains(&origin) {
            return Err(AcquisitionError::PermissionDenied { origin });
        }
        if self.options.unavailable.contains(&origin) {
            return Err(AcquisitionError::DeviceUnavailable {
                origin,
                detail: "no synthetic device attached".to_string(),
            });
        }

        let mut stream = MediaStream::new();
        stream.add_track(self.spawn_video(origin, constraints));
        if constraints.audio {
            stream.add_track(self.spawn_audio(origin));
        }

        debug!(
            "Synthetic {} stream ready ({} live tracks overall)",
            origin,
            self.live_tracks()
        );

        Ok(stream)
    }

    fn supports(&self, origin: Origin) -> bool {
        self.options.supported.contains(&origin)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

async fn watch_revocation(
    sink: TrackSink<VideoFrame>,
    origin: Origin,
    mut revoke_rx: broadcast::Receiver<Origin>,
) {
    loop {
        tokio::select! {
            _ = sink.stopped() => break,
            revoked = revoke_rx.recv() => match revoked {
                Ok(target) if target == origin => {
                    sink.end(TrackEnd::Revoked);
                    break;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn produce_video(
    sink: TrackSink<VideoFrame>,
    width: u32,
    height: u32,
    frame_rate: f64,
    origin: Origin,
) {
    let Some(pool) = sink.pool().cloned() else {
        return;
    };
    let base = test_pattern(width, height, origin);
    let period = Duration::from_secs_f64(1.0 / frame_rate.max(1.0));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut sequence: u32 = 0;

    loop {
        tokio::select! {
            _ = sink.stopped() => break,
            _ = ticker.tick() => {}
        }

        // Waits here while the consumer still holds the previous buffer
        let slot = tokio::select! {
            slot = pool.acquire() => slot,
            _ = sink.stopped() => None,
        };
        let Some(slot) = slot else {
            break;
        };

        let mut image = base.clone();
        draw_marker(&mut image, sequence);
        let frame = VideoFrame::pooled(image, Some(started.elapsed()), slot);
        if !sink.send(frame).await {
            break;
        }
        sequence = sequence.wrapping_add(1);
    }

    debug!("Synthetic {} video producer stopped after {} frames", origin, sequence);
}

async fn produce_audio(
    sink: TrackSink<AudioFrame>,
    sample_rate: u32,
    channels: u16,
    frame_ms: u64,
    tone_hz: f32,
    origin: Origin,
) {
    let samples_per_channel = (sample_rate as u64 * frame_ms / 1000) as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(frame_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let started = Instant::now();
    let mut phase_index: u64 = 0;

    loop {
        tokio::select! {
            _ = sink.stopped() => break,
            _ = ticker.tick() => {}
        }

        let mut samples = Vec::with_capacity(samples_per_channel * channels as usize);
        for _ in 0..samples_per_channel {
            let t = phase_index as f32 / sample_rate as f32;
            let value = ((2.0 * PI * tone_hz * t).sin() * 8000.0) as i16;
            for _ in 0..channels {
                samples.push(value);
            }
            phase_index += 1;
        }

        let frame = AudioFrame {
            samples,
            sample_rate,
            channels,
            timestamp_ms: started.elapsed().as_millis() as u64,
            origin,
        };
        if !sink.send(frame).await {
            break;
        }
    }

    debug!("Synthetic {} audio producer stopped", origin);
}

/// Vertical colour bars, tinted per origin so composites are easy to read
fn test_pattern(width: u32, height: u32, origin: Origin) -> RgbaImage {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];
    let bar_width = (width / BARS.len() as u32).max(1);

    RgbaImage::from_fn(width.max(1), height.max(1), |x, _| {
        let bar = BARS[((x / bar_width) as usize).min(BARS.len() - 1)];
        match origin {
            Origin::Secondary => Rgba([bar[2], bar[1], bar[0], 255]),
            _ => Rgba([bar[0], bar[1], bar[2], 255]),
        }
    })
}

/// White square sweeping across the top of the frame
fn draw_marker(image: &mut RgbaImage, sequence: u32) {
    let size = 16.min(image.width()).min(image.height());
    let travel = image.width().saturating_sub(size).max(1);
    let left = (sequence.wrapping_mul(8)) % travel;
    for y in 0..size {
        for x in left..left + size {
            image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_produces_video_and_audio() {
        let backend = SyntheticBackend::default();
        let constraints = Constraints {
            width: 64,
            height: 36,
            ..Default::default()
        };

        let stream = backend.acquire(Origin::Primary, &constraints).await.unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(backend.live_tracks(), 2);

        let video = stream.video_track().unwrap();
        let mut reader = video.video_reader().await.unwrap();
        let frame = reader.read().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 36));
        drop(frame);

        let audio = stream.audio_track().unwrap();
        let mut reader = audio.audio_reader().await.unwrap();
        let frame = reader.read().await.unwrap();
        assert_eq!(frame.samples.len(), 960);
        assert_eq!(frame.origin, Origin::Primary);

        stream.stop_all();
        assert_eq!(backend.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_denied_origin_fails() {
        let mut options = SyntheticOptions::default();
        options.denied.insert(Origin::Secondary);
        let backend = SyntheticBackend::new(options);

        let err = backend
            .acquire(Origin::Secondary, &Constraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, AcquisitionError::PermissionDenied { origin: Origin::Secondary });
        assert_eq!(backend.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_ends_video_track() {
        let backend = SyntheticBackend::default();
        let constraints = Constraints {
            width: 32,
            height: 32,
            audio: false,
            ..Default::default()
        };
        let stream = backend.acquire(Origin::Primary, &constraints).await.unwrap();
        let video = stream.video_track().unwrap().clone();
        let mut ended = video.ended();

        tokio::task::yield_now().await;
        backend.revoke(Origin::Primary);

        let state = *ended.wait_for(|s| *s != TrackEnd::Live).await.unwrap();
        assert_eq!(state, TrackEnd::Revoked);
        assert!(!video.is_released());
    }
}
