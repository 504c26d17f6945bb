use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AcquisitionError, SessionError};
use crate::media::{MediaStream, Origin, Track, TrackEnd};

/// What the caller asks of a source
#[derive(Debug, Clone, PartialEq)]
pub struct Constraints {
    /// Ideal width in pixels
    pub width: u32,
    /// Ideal height in pixels
    pub height: u32,
    /// Ideal frame rate
    pub frame_rate: f64,
    /// Whether the source should also deliver an audio track
    pub audio: bool,
    /// Specific device to open (camera id, display id)
    pub device_id: Option<String>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
            audio: true,
            device_id: None,
        }
    }
}

/// Capture backend trait
///
/// Implementations:
/// - `SyntheticBackend`: generated test patterns and tones (tests, demos)
/// - platform backends (display and camera capture) plug in here
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open the given origin. The returned stream holds one video track and,
    /// when `constraints.audio` is set and the device has one, one audio
    /// track, all tagged with `origin`.
    async fn acquire(
        &self,
        origin: Origin,
        constraints: &Constraints,
    ) -> Result<MediaStream, AcquisitionError>;

    /// Whether this backend can capture the given origin at all
    fn supports(&self, origin: Origin) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Tracks obtained from one origin
#[derive(Debug)]
pub struct AcquiredSource {
    origin: Origin,
    stream: MediaStream,
    observer: Option<JoinHandle<()>>,
}

impl AcquiredSource {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn video_track(&self) -> Option<&Track> {
        self.stream.video_track()
    }

    pub fn audio_track(&self) -> Option<&Track> {
        self.stream.audio_track()
    }

    /// Stop observing and release every track. Safe to call repeatedly.
    pub fn release(&mut self) -> usize {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
        self.stream.stop_all()
    }
}

impl Drop for AcquiredSource {
    fn drop(&mut self) {
        let released = self.release();
        if released > 0 {
            debug!("Released {} {} tracks on drop", released, self.origin);
        }
    }
}

/// Obtains raw tracks from the capture backend and watches the primary
/// video track for external termination
pub struct SourceAcquirer {
    backend: Arc<dyn CaptureBackend>,
    terminations: mpsc::UnboundedSender<SessionError>,
}

impl SourceAcquirer {
    /// `terminations` receives a `SessionError::SourceEnded` when the
    /// primary source is ended from outside the pipeline
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        terminations: mpsc::UnboundedSender<SessionError>,
    ) -> Self {
        Self {
            backend,
            terminations,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn acquire(
        &self,
        origin: Origin,
        constraints: &Constraints,
    ) -> Result<AcquiredSource, AcquisitionError> {
        let capturable = matches!(origin, Origin::Primary | Origin::Secondary);
        if !capturable || !self.backend.supports(origin) {
            return Err(AcquisitionError::Unsupported {
                origin,
                backend: self.backend.name().to_string(),
            });
        }

        info!(
            "Acquiring {} source from {} ({}x{} @ {}fps, audio={})",
            origin,
            self.backend.name(),
            constraints.width,
            constraints.height,
            constraints.frame_rate,
            constraints.audio
        );

        let stream = self.backend.acquire(origin, constraints).await?;

        let mut source = AcquiredSource {
            origin,
            stream,
            observer: None,
        };

        let Some(video) = source.video_track().cloned() else {
            source.release();
            return Err(AcquisitionError::DeviceUnavailable {
                origin,
                detail: "source delivered no video track".to_string(),
            });
        };

        if origin == Origin::Primary {
            source.observer = Some(observe_termination(&video, self.terminations.clone()));
        }

        info!(
            "Acquired {} source: {} track(s)",
            origin,
            source.stream.len()
        );

        Ok(source)
    }
}

/// Report an external end of `track` as a session error. Local releases
/// are not reported.
fn observe_termination(
    track: &Track,
    terminations: mpsc::UnboundedSender<SessionError>,
) -> JoinHandle<()> {
    let mut ended = track.ended();
    let origin = track.origin();

    tokio::spawn(async move {
        let state = match ended.wait_for(|s| *s != TrackEnd::Live).await {
            Ok(state) => *state,
            Err(_) => return,
        };

        match state {
            TrackEnd::Revoked | TrackEnd::Finished => {
                warn!("The {} source ended outside the pipeline ({:?})", origin, state);
                let _ = terminations.send(SessionError::SourceEnded { origin });
            }
            TrackEnd::Released | TrackEnd::Live => {}
        }
    })
}
