// Accelerated compositor
//
// Runs on its own task, pulling one frame from each input per output frame.
// Reads suspend until the producer delivers, and every frame is dropped at
// the end of its iteration, so each input holds at most one live buffer.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info};

use super::canvas::Surface;
use super::{AccelerationDevice, CompositorConfig};
use crate::error::CompositionError;
use crate::media::{Track, TrackSink, VideoFrame};

pub(crate) struct AcceleratedCompositor {
    task: JoinHandle<Result<(), CompositionError>>,
    ready_rx: Option<oneshot::Receiver<()>>,
}

impl AcceleratedCompositor {
    pub fn spawn(
        primary: Track,
        secondary: Track,
        sink: TrackSink<VideoFrame>,
        config: CompositorConfig,
        device: Arc<dyn AccelerationDevice>,
    ) -> Self {
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run(primary, secondary, sink, config, device, ready_tx));
        Self {
            task,
            ready_rx: Some(ready_rx),
        }
    }

    /// Resolves once the context has its surface and both readers, or with
    /// the error that kept it from getting there
    pub async fn wait_ready(&mut self) -> Result<(), CompositionError> {
        let Some(ready_rx) = self.ready_rx.take() else {
            return Ok(());
        };
        if ready_rx.await.is_ok() {
            return Ok(());
        }

        match (&mut self.task).await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(CompositionError::Input(
                "inputs ended before the compositor was ready".to_string(),
            )),
            Err(e) => Err(CompositionError::Runtime(e.to_string())),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the loop to end
    pub async fn join(mut self) -> Result<(), CompositionError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(CompositionError::Runtime(e.to_string())),
        }
    }
}

impl Drop for AcceleratedCompositor {
    // A finished task ignores the abort
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    primary: Track,
    secondary: Track,
    sink: TrackSink<VideoFrame>,
    config: CompositorConfig,
    device: Arc<dyn AccelerationDevice>,
    ready_tx: oneshot::Sender<()>,
) -> Result<(), CompositionError> {
    device.prepare(config.width, config.height).await?;

    let mut primary_reader = primary
        .video_reader()
        .await
        .ok_or_else(|| CompositionError::Input("primary track carries no video".to_string()))?;
    let mut secondary_reader = secondary
        .video_reader()
        .await
        .ok_or_else(|| CompositionError::Input("secondary track carries no video".to_string()))?;
    let pool = sink
        .pool()
        .cloned()
        .ok_or_else(|| CompositionError::Input("output track has no frame pool".to_string()))?;

    let mut surface = Surface::new(config.width, config.height);
    let interval = config.frame_interval();
    let started = Instant::now();
    let mut last_emitted: Option<Instant> = None;
    let mut emitted: u64 = 0;

    let _ = ready_tx.send(());
    info!(
        "Accelerated compositor running on {} ({}x{} @ {}fps)",
        device.name(),
        config.width,
        config.height,
        config.frame_rate
    );

    loop {
        if let Some(last) = last_emitted {
            tokio::select! {
                _ = tokio::time::sleep_until(last + interval) => {}
                _ = sink.stopped() => break,
            }
        }

        let Some(primary_frame) = primary_reader.read().await else {
            debug!("Primary input ended");
            break;
        };
        let Some(secondary_frame) = secondary_reader.read().await else {
            debug!("Secondary input ended");
            break;
        };

        let composed = surface
            .draw(Some(primary_frame.image()), Some(secondary_frame.image()))
            .clone();
        device.submit(emitted)?;

        let timestamp = primary_frame.timestamp().unwrap_or_else(|| started.elapsed());

        let slot = tokio::select! {
            slot = pool.acquire() => slot,
            _ = sink.stopped() => None,
        };
        let Some(slot) = slot else {
            break;
        };
        if !sink.send(VideoFrame::pooled(composed, Some(timestamp), slot)).await {
            break;
        }

        emitted += 1;
        last_emitted = Some(Instant::now());
    }

    info!("Accelerated compositor stopped after {} frames", emitted);
    Ok(())
}

