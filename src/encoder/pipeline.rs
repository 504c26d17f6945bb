//! Encoder pipeline
//!
//! One task owns the encoder and the chunk queue. It reads the output
//! stream, closes a segment on every flush tick and hands the queue back
//! when it is told to stop. Control messages are the only way in.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::chunk::{Artifact, ByteCount, ChunkQueue, DEFAULT_MAX_CHUNKS};
use super::codec::FrameEncoder;
use crate::error::{RecorderError, RecorderResult};
use crate::media::{AudioFrame, FrameReader, MediaStream, Track, VideoFrame};

/// Default time between flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub flush_interval: Duration,
    pub max_chunks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Inactive,
    Recording,
    Paused,
    Stopping,
}

/// Emitted by the pipeline task
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A chunk was queued
    DataAvailable { size: usize },
    /// The encoder failed; no further chunks will be produced
    Error { message: String },
}

/// Queue bookkeeping visible while the task runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub chunks_queued: usize,
    pub bytes_queued: usize,
    pub chunks_emitted: u64,
    pub chunks_evicted: u64,
}

enum Control {
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
}

struct PipelineOutput {
    queue: ChunkQueue,
    recorded: Duration,
    failure: Option<String>,
}

/// Running encoder attached to one output stream
pub struct EncoderPipeline {
    mime_type: String,
    state: Arc<Mutex<PipelineState>>,
    progress: Arc<Mutex<PipelineProgress>>,
    control: mpsc::UnboundedSender<Control>,
    task: Option<JoinHandle<PipelineOutput>>,
}

impl EncoderPipeline {
    /// Start encoding the first video track and first audio track of
    /// `stream`
    pub fn start(
        stream: &MediaStream,
        encoder: Box<dyn FrameEncoder>,
        mime_type: impl Into<String>,
        config: PipelineConfig,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> EncoderPipeline {
        let mime_type = mime_type.into();
        let (control, control_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(Mutex::new(PipelineProgress::default()));

        info!(
            "Starting encoder pipeline ({}, flush every {:?}, max {} chunks)",
            mime_type, config.flush_interval, config.max_chunks
        );

        let task = tokio::spawn(run_pipeline(
            stream.video_track().cloned(),
            stream.audio_track().cloned(),
            encoder,
            config,
            control_rx,
            events,
            Arc::clone(&progress),
        ));

        EncoderPipeline {
            mime_type,
            state: Arc::new(Mutex::new(PipelineState::Recording)),
            progress,
            control,
            task: Some(task),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn progress(&self) -> PipelineProgress {
        *self.progress.lock()
    }

    /// No-op unless recording
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PipelineState::Recording {
            return false;
        }
        *state = PipelineState::Paused;
        let _ = self.control.send(Control::Pause);
        true
    }

    /// No-op unless paused
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PipelineState::Paused {
            return false;
        }
        *state = PipelineState::Recording;
        let _ = self.control.send(Control::Resume);
        true
    }

    /// Flush what is pending, wait for the task and assemble the queued
    /// chunks. Returns `None` if the pipeline was already stopped.
    pub async fn stop(&mut self) -> RecorderResult<Option<Artifact>> {
        let Some(task) = self.task.take() else {
            return Ok(None);
        };
        *self.state.lock() = PipelineState::Stopping;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(Control::Stop(ack_tx)).is_ok() {
            // Dropped sender means the task is already gone; join tells us how
            let _ = ack_rx.await;
        }

        let result = task.await;
        *self.state.lock() = PipelineState::Inactive;

        let output = result.map_err(|e| {
            RecorderError::EncoderRuntime(format!("encoder task did not complete: {e}"))
        })?;

        if let Some(failure) = &output.failure {
            warn!("Assembling partial recording after encoder failure: {}", failure);
        }

        let artifact = output.queue.into_artifact(self.mime_type.clone(), output.recorded);
        if artifact.is_empty() {
            info!("Encoder pipeline stopped, no data captured");
        } else {
            info!(
                "Encoder pipeline stopped: {} chunks, {}, {:.1}s recorded",
                artifact.chunk_count,
                ByteCount(artifact.size()),
                artifact.duration.as_secs_f64()
            );
        }
        Ok(Some(artifact))
    }

    /// Terminate without flushing and drop the queue
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            *self.state.lock() = PipelineState::Inactive;
            debug!("Encoder pipeline aborted");
        }
    }
}

impl Drop for EncoderPipeline {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn next_frame<T>(reader: Option<&mut FrameReader<T>>) -> Option<T> {
    match reader {
        Some(reader) => reader.read().await,
        None => std::future::pending().await,
    }
}

struct Encoding {
    encoder: Box<dyn FrameEncoder>,
    queue: ChunkQueue,
    failure: Option<String>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    progress: Arc<Mutex<PipelineProgress>>,
}

impl Encoding {
    fn encode_video(&mut self, frame: &VideoFrame) {
        if self.failure.is_none() {
            let result = self.encoder.encode_video(frame);
            self.check(result);
        }
    }

    fn encode_audio(&mut self, frame: &AudioFrame) {
        if self.failure.is_none() {
            let result = self.encoder.encode_audio(frame);
            self.check(result);
        }
    }

    fn flush(&mut self) {
        if self.failure.is_some() {
            return;
        }
        match self.encoder.flush() {
            Ok(data) if data.is_empty() => debug!("Nothing to flush"),
            Ok(data) => {
                let size = data.len();
                self.queue.push(data);
                {
                    let mut progress = self.progress.lock();
                    progress.chunks_queued = self.queue.len();
                    progress.bytes_queued = self.queue.total_bytes();
                    progress.chunks_emitted = self.queue.pushed();
                    progress.chunks_evicted = self.queue.evicted();
                }
                debug!("Queued chunk {} ({})", self.queue.pushed() - 1, ByteCount(size));
                let _ = self.events.send(PipelineEvent::DataAvailable { size });
            }
            Err(e) => self.check(Err(e)),
        }
    }

    fn check(&mut self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            let message = format!("{e:#}");
            error!("Encoder failed: {}", message);
            let _ = self.events.send(PipelineEvent::Error {
                message: message.clone(),
            });
            self.failure = Some(message);
        }
    }
}

async fn run_pipeline(
    video: Option<Track>,
    audio: Option<Track>,
    encoder: Box<dyn FrameEncoder>,
    config: PipelineConfig,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    progress: Arc<Mutex<PipelineProgress>>,
) -> PipelineOutput {
    let mut video_reader = match &video {
        Some(track) => track.video_reader().await,
        None => None,
    };
    let mut audio_reader = match &audio {
        Some(track) => track.audio_reader().await,
        None => None,
    };
    let mut video_open = video_reader.is_some();
    let mut audio_open = audio_reader.is_some();

    let mut encoding = Encoding {
        encoder,
        queue: ChunkQueue::new(config.max_chunks),
        failure: None,
        events,
        progress,
    };

    let mut flush = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut paused = false;
    let mut running_since = Instant::now();
    let mut recorded = Duration::ZERO;
    let mut discarded: u64 = 0;

    loop {
        tokio::select! {
            biased;

            command = control.recv() => match command {
                Some(Control::Pause) if !paused => {
                    recorded += running_since.elapsed();
                    paused = true;
                    info!("Encoder paused");
                }
                Some(Control::Resume) if paused => {
                    running_since = Instant::now();
                    paused = false;
                    flush.reset();
                    info!("Encoder resumed");
                }
                Some(Control::Pause) | Some(Control::Resume) => {}
                Some(Control::Stop(ack)) => {
                    encoding.flush();
                    let _ = ack.send(());
                    break;
                }
                None => {
                    encoding.flush();
                    break;
                }
            },

            _ = flush.tick(), if !paused => encoding.flush(),

            frame = next_frame(video_reader.as_mut()), if video_open => match frame {
                Some(frame) if paused => {
                    discarded += 1;
                    drop(frame);
                }
                Some(frame) => encoding.encode_video(&frame),
                None => {
                    debug!("Video input ended");
                    video_open = false;
                }
            },

            frame = next_frame(audio_reader.as_mut()), if audio_open => match frame {
                Some(_) if paused => discarded += 1,
                Some(frame) => encoding.encode_audio(&frame),
                None => {
                    debug!("Audio input ended");
                    audio_open = false;
                }
            },
        }
    }

    if !paused {
        recorded += running_since.elapsed();
    }
    if discarded > 0 {
        debug!("Discarded {} frames received while paused", discarded);
    }

    PipelineOutput {
        queue: encoding.queue,
        recorded,
        failure: encoding.failure,
    }
}
