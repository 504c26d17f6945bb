//! Frame types and the per-track buffer pool.
//!
//! Video frames are scope-owned: each one holds a slot from the frame pool
//! of the track that produced it, and the slot goes back to the pool when
//! the frame is dropped. A producer that cannot get a slot waits, which is
//! how a slow consumer pushes back on its source.

use image::RgbaImage;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::track::Origin;

/// Bounded pool of frame buffers for one video track
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    capacity: usize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free buffer. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<FrameSlot> {
        let permit = Arc::clone(&self.inner.permits).acquire_owned().await.ok()?;
        Some(self.slot(permit))
    }

    /// Take a free buffer without waiting
    pub fn try_acquire(&self) -> Option<FrameSlot> {
        let permit = Arc::clone(&self.inner.permits).try_acquire_owned().ok()?;
        Some(self.slot(permit))
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> FrameSlot {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(live, Ordering::SeqCst);
        FrameSlot {
            _permit: permit,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Wake every waiting producer; further acquisitions fail
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers currently held by frames
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Highest number of buffers ever held at once
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.inner.capacity)
            .field("live", &self.live())
            .field("peak", &self.peak())
            .finish()
    }
}

/// One borrowed pool buffer, returned on drop
pub struct FrameSlot {
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A timestamped RGBA bitmap
pub struct VideoFrame {
    image: RgbaImage,
    /// Capture time relative to the start of the source
    timestamp: Option<Duration>,
    slot: Option<FrameSlot>,
}

impl VideoFrame {
    /// Frame that is not backed by a pool buffer
    pub fn new(image: RgbaImage, timestamp: Option<Duration>) -> Self {
        Self {
            image,
            timestamp,
            slot: None,
        }
    }

    pub fn pooled(image: RgbaImage, timestamp: Option<Duration>, slot: FrameSlot) -> Self {
        Self {
            image,
            timestamp,
            slot: Some(slot),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    /// Keep the pixels and give the buffer slot back to the pool
    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("timestamp", &self.timestamp)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the source started
    pub timestamp_ms: u64,
    /// Where the samples came from
    pub origin: Origin,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_tracks_live_and_peak() {
        let pool = FramePool::new(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!(pool.live(), 2);
        assert!(pool.try_acquire().is_none(), "pool should be exhausted");

        drop(a);
        assert_eq!(pool.live(), 1);
        drop(b);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.peak(), 2);
    }

    #[tokio::test]
    async fn test_dropping_frame_releases_slot() {
        let pool = FramePool::new(1);
        let slot = pool.acquire().await.unwrap();
        let frame = VideoFrame::pooled(RgbaImage::new(4, 4), None, slot);
        assert_eq!(pool.live(), 1);

        let image = frame.into_image();
        assert_eq!(image.width(), 4);
        assert_eq!(pool.live(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_closed_pool_wakes_waiters() {
        let pool = FramePool::new(1);
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_none() })
        };
        tokio::task::yield_now().await;
        pool.close();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame {
            samples: vec![0; 960],
            sample_rate: 48000,
            channels: 1,
            timestamp_ms: 0,
            origin: Origin::Primary,
        };
        assert_eq!(frame.duration(), Duration::from_millis(20));
    }
}
