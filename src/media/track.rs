//! Tracks and streams
//!
//! A `Track` is a cheap cloneable handle to one media channel. Frames are
//! read through a `FrameReader`, which holds the track's receiver
//! exclusively until it is dropped, so a consumer can hand the track over to
//! another consumer (e.g. when the compositor falls back to software).
//! The producing side writes through a `TrackSink`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::frame::{AudioFrame, FramePool, VideoFrame};

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Logical source of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Display capture
    Primary,
    /// Camera capture
    Secondary,
    /// Output of the audio mixer
    Mixed,
    /// Output of the compositor
    Composed,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::Primary => "primary",
            Origin::Secondary => "secondary",
            Origin::Mixed => "mixed",
            Origin::Composed => "composed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a track as seen by its observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackEnd {
    /// Still producing
    Live,
    /// Ended from outside the pipeline (e.g. the user revoked sharing)
    Revoked,
    /// The producer ran out of media
    Finished,
    /// Released by the pipeline
    Released,
}

/// Negotiated properties of a track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub device_id: Option<String>,
}

impl TrackSettings {
    pub fn video(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
            ..Default::default()
        }
    }

    pub fn audio(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

enum TrackMedia {
    Video {
        reader: Arc<AsyncMutex<mpsc::Receiver<VideoFrame>>>,
        pool: FramePool,
    },
    Audio {
        reader: Arc<AsyncMutex<mpsc::Receiver<AudioFrame>>>,
    },
}

struct TrackInner {
    id: Uuid,
    kind: TrackKind,
    origin: Origin,
    label: String,
    settings: TrackSettings,
    media: TrackMedia,
    released: AtomicBool,
    state: watch::Sender<TrackEnd>,
    release_hooks: Mutex<Vec<ReleaseHook>>,
}

/// Handle to one media channel
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

impl Track {
    /// Create a video track whose producer may hold at most `pool_capacity`
    /// frames at once
    pub fn video(
        origin: Origin,
        label: impl Into<String>,
        settings: TrackSettings,
        pool_capacity: usize,
    ) -> (Track, TrackSink<VideoFrame>) {
        let pool = FramePool::new(pool_capacity);
        let (tx, rx) = mpsc::channel(pool.capacity());
        let media = TrackMedia::Video {
            reader: Arc::new(AsyncMutex::new(rx)),
            pool: pool.clone(),
        };
        let track = Self::build(TrackKind::Video, origin, label.into(), settings, media);
        let sink = TrackSink {
            tx,
            track: track.clone(),
            pool: Some(pool),
        };
        (track, sink)
    }

    /// Create an audio track buffering up to `capacity` frames
    pub fn audio(
        origin: Origin,
        label: impl Into<String>,
        settings: TrackSettings,
        capacity: usize,
    ) -> (Track, TrackSink<AudioFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let media = TrackMedia::Audio {
            reader: Arc::new(AsyncMutex::new(rx)),
        };
        let track = Self::build(TrackKind::Audio, origin, label.into(), settings, media);
        let sink = TrackSink {
            tx,
            track: track.clone(),
            pool: None,
        };
        (track, sink)
    }

    fn build(
        kind: TrackKind,
        origin: Origin,
        label: String,
        settings: TrackSettings,
        media: TrackMedia,
    ) -> Track {
        let (state, _) = watch::channel(TrackEnd::Live);
        Track {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                kind,
                origin,
                label,
                settings,
                media,
                released: AtomicBool::new(false),
                state,
                release_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn settings(&self) -> &TrackSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> TrackEnd {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackEnd::Live
    }

    /// Observe lifecycle changes
    pub fn ended(&self) -> watch::Receiver<TrackEnd> {
        self.inner.state.subscribe()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn frame_pool(&self) -> Option<FramePool> {
        match &self.inner.media {
            TrackMedia::Video { pool, .. } => Some(pool.clone()),
            TrackMedia::Audio { .. } => None,
        }
    }

    /// Run `hook` when the track is released. Runs immediately if it
    /// already was.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_released() {
            hook();
            return;
        }
        self.inner.release_hooks.lock().push(Box::new(hook));
    }

    /// Release the track. Returns false if it had already been released.
    pub fn stop(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        debug!("Releasing {} {:?} track {}", self.origin(), self.kind(), self.label());

        self.inner.state.send_replace(TrackEnd::Released);
        if let TrackMedia::Video { pool, .. } = &self.inner.media {
            pool.close();
        }

        let hooks = std::mem::take(&mut *self.inner.release_hooks.lock());
        for hook in hooks {
            hook();
        }

        true
    }

    /// Take exclusive read access to the video frames
    pub async fn video_reader(&self) -> Option<FrameReader<VideoFrame>> {
        match &self.inner.media {
            TrackMedia::Video { reader, .. } => Some(FrameReader {
                guard: Arc::clone(reader).lock_owned().await,
            }),
            TrackMedia::Audio { .. } => None,
        }
    }

    /// Take exclusive read access to the audio frames
    pub async fn audio_reader(&self) -> Option<FrameReader<AudioFrame>> {
        match &self.inner.media {
            TrackMedia::Audio { reader } => Some(FrameReader {
                guard: Arc::clone(reader).lock_owned().await,
            }),
            TrackMedia::Video { .. } => None,
        }
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Producer side of a track
pub struct TrackSink<T> {
    tx: mpsc::Sender<T>,
    track: Track,
    pool: Option<FramePool>,
}

impl<T> Clone for TrackSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            track: self.track.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<T: Send> TrackSink<T> {
    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn pool(&self) -> Option<&FramePool> {
        self.pool.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        !self.track.is_live()
    }

    /// Resolves once the track leaves the live state
    pub async fn stopped(&self) {
        let mut state = self.track.ended();
        let _ = state.wait_for(|s| *s != TrackEnd::Live).await;
    }

    /// Deliver one item, waiting for the consumer. Returns false when the
    /// track is no longer live or nobody reads it any more.
    pub async fn send(&self, item: T) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(item) => sent.is_ok(),
            _ = self.stopped() => false,
        }
    }

    /// Deliver one item if the consumer has room for it
    pub fn try_send(&self, item: T) -> bool {
        !self.is_stopped() && self.tx.try_send(item).is_ok()
    }

    /// Mark the track as ended by the producer side
    pub fn end(&self, reason: TrackEnd) {
        self.track.inner.state.send_if_modified(|state| {
            if *state == TrackEnd::Live {
                *state = reason;
                true
            } else {
                false
            }
        });
    }
}

/// Exclusive reader over a track's frames
pub struct FrameReader<T> {
    guard: OwnedMutexGuard<mpsc::Receiver<T>>,
}

impl<T> FrameReader<T> {
    /// Suspend until the next frame; `None` at end of stream
    pub async fn read(&mut self) -> Option<T> {
        self.guard.recv().await
    }

    pub fn try_read(&mut self) -> Result<T, TryRecvError> {
        self.guard.try_recv()
    }

    /// Drain everything queued and keep only the most recent item.
    /// Returns the item (if any) and whether the stream has ended.
    pub fn latest(&mut self) -> (Option<T>, bool) {
        let mut newest = None;
        loop {
            match self.guard.try_recv() {
                Ok(item) => newest = Some(item),
                Err(TryRecvError::Empty) => return (newest, false),
                Err(TryRecvError::Disconnected) => return (newest, true),
            }
        }
    }
}

/// Ordered set of tracks with unique (origin, kind) pairs
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Track>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: impl IntoIterator<Item = Track>) -> Self {
        let mut stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    /// Add a track. Returns false if a track with the same origin and kind
    /// is already present.
    pub fn add_track(&mut self, track: Track) -> bool {
        let duplicate = self
            .tracks
            .iter()
            .any(|t| t.origin() == track.origin() && t.kind() == track.kind());
        if duplicate {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn video_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn track_for(&self, origin: Origin, kind: TrackKind) -> Option<&Track> {
        self.tracks
            .iter()
            .find(|t| t.origin() == origin && t.kind() == kind)
    }

    /// Release every track; returns how many were released by this call
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}
