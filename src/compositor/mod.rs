//! Video compositor
//!
//! Merges the primary and secondary video tracks into one composed track.
//! Two variants exist:
//! - Accelerated: isolated task with backpressured reads, used when the
//!   acceleration device passes its capability probe
//! - Software: render-clock driven redraw loop, used otherwise and as the
//!   fallback when the accelerated variant is not ready in time or fails
//!
//! Exactly one variant is active at a time. Switching starts a fresh
//! surface and writes to the same output track.

mod accelerated;
pub mod canvas;
mod software;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::error::CompositionError;
use crate::media::{Origin, Track, TrackEnd, TrackKind, TrackSettings, TrackSink, VideoFrame};
use accelerated::AcceleratedCompositor;
use software::SoftwareCompositor;

pub use canvas::{InsetLayout, Surface};

/// How long the accelerated variant may take to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Output frames buffered between the compositor and its consumer
const OUTPUT_POOL_CAPACITY: usize = 2;

/// Target geometry and timing of the composed track
#[derive(Debug, Clone, PartialEq)]
pub struct CompositorConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Deadline for the accelerated variant to signal readiness
    pub ready_timeout: Duration,
}

impl CompositorConfig {
    pub fn new(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width,
            height,
            frame_rate,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1.0))
    }
}

/// Device backing the accelerated compositor
#[async_trait]
pub trait AccelerationDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Capability probe
    fn is_available(&self) -> bool;

    /// Allocate the compositing surface. The accelerated variant signals
    /// readiness once this returns.
    async fn prepare(&self, width: u32, height: u32) -> Result<(), CompositionError>;

    /// Hand one composed frame to the device
    fn submit(&self, _frame_index: u64) -> Result<(), CompositionError> {
        Ok(())
    }
}

/// Runs the accelerated loop on a dedicated task of the host runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct IsolatedDevice;

#[async_trait]
impl AccelerationDevice for IsolatedDevice {
    fn name(&self) -> &str {
        "isolated task"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn prepare(&self, _width: u32, _height: u32) -> Result<(), CompositionError> {
        Ok(())
    }
}

/// Which variant is producing frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositorVariant {
    Software,
    Accelerated,
}

/// Called with the reason each time composition falls back to software
pub type FallbackHook = Arc<dyn Fn(&CompositionError) + Send + Sync>;

enum ActiveCompositor {
    Software(SoftwareCompositor),
    Accelerated(AbortHandle),
}

impl ActiveCompositor {
    fn abort(&self) {
        match self {
            ActiveCompositor::Software(software) => software.abort(),
            ActiveCompositor::Accelerated(handle) => handle.abort(),
        }
    }
}

struct Slots {
    stopped: bool,
    active: Option<ActiveCompositor>,
}

/// Inputs and settings needed to (re)start a variant
#[derive(Clone)]
struct Inputs {
    primary: Track,
    secondary: Track,
    sink: TrackSink<VideoFrame>,
    config: CompositorConfig,
}

impl Inputs {
    fn spawn_software(&self) -> SoftwareCompositor {
        SoftwareCompositor::spawn(
            self.primary.clone(),
            self.secondary.clone(),
            self.sink.clone(),
            self.config.clone(),
        )
    }
}

/// Running compositor and its composed output track
pub struct Compositor {
    output: Track,
    slots: Arc<Mutex<Slots>>,
    variant: watch::Receiver<CompositorVariant>,
    supervisor: Option<JoinHandle<()>>,
}

impl Compositor {
    /// Start compositing. Prefers the accelerated variant when `device`
    /// passes its probe; resolves once a variant is producing frames.
    pub async fn start(
        primary: &Track,
        secondary: &Track,
        config: CompositorConfig,
        device: Option<Arc<dyn AccelerationDevice>>,
        on_fallback: FallbackHook,
    ) -> Result<Compositor, CompositionError> {
        for track in [primary, secondary] {
            if track.kind() != TrackKind::Video {
                return Err(CompositionError::Input(format!(
                    "{} track is not a video track",
                    track.origin()
                )));
            }
        }

        let settings = TrackSettings::video(config.width, config.height, config.frame_rate);
        let (output, sink) = Track::video(Origin::Composed, "Composed", settings, OUTPUT_POOL_CAPACITY);
        let inputs = Inputs {
            primary: primary.clone(),
            secondary: secondary.clone(),
            sink,
            config: config.clone(),
        };

        let slots = Arc::new(Mutex::new(Slots {
            stopped: false,
            active: None,
        }));
        let (variant_tx, variant) = watch::channel(CompositorVariant::Software);

        let mut supervisor = None;
        match device.filter(|d| d.is_available()) {
            Some(device) => {
                info!("Starting accelerated compositor on {}", device.name());
                let mut accelerated = AcceleratedCompositor::spawn(
                    primary.clone(),
                    secondary.clone(),
                    inputs.sink.clone(),
                    config.clone(),
                    device,
                );

                let ready = match tokio::time::timeout(config.ready_timeout, accelerated.wait_ready()).await {
                    Ok(result) => result,
                    Err(_) => Err(CompositionError::ReadyTimeout(config.ready_timeout)),
                };

                match ready {
                    Ok(()) => {
                        slots.lock().active = Some(ActiveCompositor::Accelerated(accelerated.abort_handle()));
                        variant_tx.send_replace(CompositorVariant::Accelerated);
                        supervisor = Some(tokio::spawn(supervise(
                            accelerated,
                            inputs,
                            Arc::clone(&slots),
                            variant_tx,
                            on_fallback,
                        )));
                    }
                    Err(reason) => {
                        accelerated.abort();
                        warn!("Accelerated compositor unavailable, using software: {}", reason);
                        on_fallback(&reason);
                        slots.lock().active = Some(ActiveCompositor::Software(inputs.spawn_software()));
                    }
                }
            }
            None => {
                info!("No acceleration available, starting software compositor");
                slots.lock().active = Some(ActiveCompositor::Software(inputs.spawn_software()));
            }
        }

        Ok(Compositor {
            output,
            slots,
            variant,
            supervisor,
        })
    }

    /// The composed video track
    pub fn output(&self) -> &Track {
        &self.output
    }

    pub fn variant(&self) -> CompositorVariant {
        *self.variant.borrow()
    }

    /// Observe variant switches
    pub fn watch_variant(&self) -> watch::Receiver<CompositorVariant> {
        self.variant.clone()
    }

    /// Terminate the active variant without draining and release the
    /// output track. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        {
            let mut slots = self.slots.lock();
            if slots.stopped {
                return false;
            }
            slots.stopped = true;
            if let Some(active) = slots.active.take() {
                active.abort();
            }
        }

        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        self.output.stop();
        info!("Compositor stopped");
        true
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Restart on the software variant if the accelerated loop fails
async fn supervise(
    accelerated: AcceleratedCompositor,
    inputs: Inputs,
    slots: Arc<Mutex<Slots>>,
    variant_tx: watch::Sender<CompositorVariant>,
    on_fallback: FallbackHook,
) {
    match accelerated.join().await {
        Ok(()) => {
            info!("Accelerated compositor reached the end of its inputs");
            inputs.sink.end(TrackEnd::Finished);
        }
        Err(reason) => {
            let mut slots = slots.lock();
            if slots.stopped {
                return;
            }
            warn!("Accelerated compositor failed, restarting in software: {}", reason);
            on_fallback(&reason);
            slots.active = Some(ActiveCompositor::Software(inputs.spawn_software()));
            variant_tx.send_replace(CompositorVariant::Software);
        }
    }
}
