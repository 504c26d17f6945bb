//! Session controller
//!
//! Owns the session state machine and every resource a session holds:
//! acquired sources, the compositor, the audio mix and the encoder pipeline.
//! All teardown goes through `Resources`, so releasing is the same code
//! whether a session stops normally, fails while starting or is cancelled.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{CaptureMode, RecorderConfig};
use super::state::{RecorderEvent, SessionState};
use super::stats::SessionStats;
use crate::audio::{select_inputs, AudioMixer, MixedAudio};
use crate::capture::{AcquiredSource, CaptureBackend, SourceAcquirer};
use crate::compositor::{AccelerationDevice, Compositor, CompositorConfig, FallbackHook};
use crate::config::Settings;
use crate::encoder::{
    negotiate, Artifact, EncoderHost, EncoderPipeline, EncoderSettings, PipelineEvent,
    PipelineProgress,
};
use crate::error::{
    AcquisitionError, CompositionError, RecorderError, RecorderResult, SessionError,
};
use crate::media::{MediaStream, Origin, Track};

/// Host capabilities a recorder runs against
#[derive(Clone)]
pub struct HostContext {
    pub capture: Arc<dyn CaptureBackend>,
    pub encoder: Arc<dyn EncoderHost>,
    /// Device for the accelerated compositor; software only when `None`
    pub accelerator: Option<Arc<dyn AccelerationDevice>>,
    pub settings: Settings,
}

impl HostContext {
    pub fn new(capture: Arc<dyn CaptureBackend>, encoder: Arc<dyn EncoderHost>) -> Self {
        Self {
            capture,
            encoder,
            accelerator: None,
            settings: Settings::default(),
        }
    }

    pub fn with_accelerator(mut self, device: Arc<dyn AccelerationDevice>) -> Self {
        self.accelerator = Some(device);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

/// Everything a session holds while it runs
#[derive(Default)]
struct Resources {
    sources: Vec<AcquiredSource>,
    compositor: Option<Compositor>,
    audio: Option<MixedAudio>,
    pipeline: Option<EncoderPipeline>,
    supervisor: Option<JoinHandle<()>>,
}

impl Resources {
    fn is_empty(&self) -> bool {
        self.sources.is_empty()
            && self.compositor.is_none()
            && self.audio.is_none()
            && self.pipeline.is_none()
            && self.supervisor.is_none()
    }

    /// Stop composition and mixing and release every acquired track
    fn release_sources(&mut self) -> usize {
        if let Some(mut compositor) = self.compositor.take() {
            compositor.stop();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }
        self.sources.drain(..).map(|mut source| source.release()).sum()
    }

    /// Hard teardown, nothing is flushed
    fn release_all(&mut self) -> usize {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        self.release_sources()
    }
}

struct Inner {
    state: SessionState,
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
    resources: Resources,
    pending: Option<Artifact>,
    mode: Option<CaptureMode>,
    started_at: Option<DateTime<Utc>>,
    mime_type: Option<String>,
    last_progress: PipelineProgress,
}

struct Shared {
    host: HostContext,
    events: broadcast::Sender<RecorderEvent>,
    inner: Mutex<Inner>,
}

/// Dual-source recorder
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    pub fn new(host: HostContext) -> Self {
        let (events, _) = broadcast::channel(host.settings.pipeline.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                host,
                events,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    cancel: None,
                    resources: Resources::default(),
                    pending: None,
                    mode: None,
                    started_at: None,
                    mime_type: None,
                    last_progress: PipelineProgress::default(),
                }),
            }),
        }
    }

    pub fn host(&self) -> &HostContext {
        &self.shared.host
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Receive session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.shared.inner.lock();
        let progress = inner
            .resources
            .pipeline
            .as_ref()
            .map(|p| p.progress())
            .unwrap_or(inner.last_progress);

        let duration_secs = match (inner.started_at, inner.state) {
            (Some(started), state) if state != SessionState::Idle => {
                (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };

        SessionStats {
            state: inner.state,
            mode: inner.mode,
            started_at: inner.started_at,
            duration_secs,
            mime_type: inner.mime_type.clone(),
            chunks_count: progress.chunks_emitted,
            bytes_queued: progress.bytes_queued,
            chunks_evicted: progress.chunks_evicted,
            compositor: inner.resources.compositor.as_ref().map(|c| c.variant()),
        }
    }

    fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn transition(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            debug!("Session {} -> {}", inner.state, state);
            inner.state = state;
            self.emit(RecorderEvent::StateChanged { state });
        }
    }

    fn fail(&self, error: &RecorderError) {
        error!("Recording session failed: {}", error);
        self.emit(RecorderEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }

    /// Start a session. Resolves once the encoder is running, or with the
    /// error that made the session roll back to idle.
    pub async fn start(&self, config: RecorderConfig) -> RecorderResult<()> {
        config.validate()?;

        let (generation, cancelled) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::AlreadyActive.into());
            }
            if inner.pending.take().is_some() {
                warn!("Discarding the unclaimed recording of the previous session");
            }

            inner.generation += 1;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            inner.cancel = Some(cancel_tx);
            inner.mode = Some(config.mode);
            inner.started_at = None;
            inner.mime_type = None;
            inner.last_progress = PipelineProgress::default();
            self.transition(&mut inner, SessionState::Starting);
            (inner.generation, cancel_rx)
        };

        info!("Starting {:?} recording session {}", config.mode, generation);

        let result = tokio::select! {
            result = self.build_session(generation, &config) => result,
            _ = wait_cancelled(cancelled) => Err(SessionError::Cancelled.into()),
        };

        match result {
            Ok(()) => {
                let mut inner = self.shared.inner.lock();
                if inner.generation != generation {
                    return Err(SessionError::Cancelled.into());
                }
                let state = inner.state;
                match state {
                    SessionState::Starting => {
                        inner.started_at = Some(Utc::now());
                        self.transition(&mut inner, SessionState::Recording);
                        info!("Recording session {} started", generation);
                        Ok(())
                    }
                    // The encoder failed in the first moments; the session
                    // exists and its stop() returns what was captured
                    SessionState::Error => Ok(()),
                    _ => Err(SessionError::Cancelled.into()),
                }
            }
            Err(e) => {
                let rolled_back = self.rollback(generation);
                if rolled_back > 0 {
                    info!("Rolled back {} acquired track(s)", rolled_back);
                }
                if !matches!(e, RecorderError::Session(SessionError::Cancelled)) {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }

    /// Negotiate, acquire and wire the session, staging every resource as
    /// soon as it exists
    async fn build_session(&self, generation: u64, config: &RecorderConfig) -> RecorderResult<()> {
        let host = &self.shared.host;

        let mime_type = negotiate(host.encoder.as_ref(), &host.settings.pipeline.codec_preferences)?;
        self.shared.inner.lock().mime_type = Some(mime_type.clone());

        let (terminations_tx, terminations) = mpsc::unbounded_channel();
        let acquirer = SourceAcquirer::new(Arc::clone(&host.capture), terminations_tx);

        let mut primary_audio = None;
        let mut secondary_audio = None;

        let video = match config.mode {
            CaptureMode::PrimaryOnly => {
                let source = acquirer.acquire(Origin::Primary, &config.primary_constraints()).await?;
                let video = video_of(&source)?;
                primary_audio = source.audio_track().cloned();
                self.stage(generation, source, |r, s| r.sources.push(s))?;
                video
            }
            CaptureMode::SecondaryOnly => {
                let source = acquirer
                    .acquire(Origin::Secondary, &config.secondary_constraints())
                    .await?;
                let video = video_of(&source)?;
                secondary_audio = source.audio_track().cloned();
                self.stage(generation, source, |r, s| r.sources.push(s))?;
                video
            }
            CaptureMode::Combined => {
                let primary = acquirer.acquire(Origin::Primary, &config.primary_constraints()).await?;
                let primary_video = video_of(&primary)?;
                primary_audio = primary.audio_track().cloned();
                self.stage(generation, primary, |r, s| r.sources.push(s))?;

                let secondary = acquirer
                    .acquire(Origin::Secondary, &config.secondary_constraints())
                    .await?;
                let secondary_video = video_of(&secondary)?;
                secondary_audio = secondary.audio_track().cloned();
                self.stage(generation, secondary, |r, s| r.sources.push(s))?;

                let compositor = self.start_compositor(config, &primary_video, &secondary_video).await?;
                let composed = compositor.output().clone();
                self.stage(generation, compositor, |r, c| r.compositor = Some(c))?;
                composed
            }
        };

        let inputs = select_inputs(
            config.mode,
            &config.audio,
            primary_audio.as_ref(),
            secondary_audio.as_ref(),
        );
        let mixed = AudioMixer::default().build(inputs);
        let audio = mixed.track().cloned();
        self.stage(generation, mixed, |r, m| r.audio = Some(m))?;

        let stream = MediaStream::from_tracks(std::iter::once(video.clone()).chain(audio));
        let settings = EncoderSettings {
            mime_type: mime_type.clone(),
            width: video.settings().width.unwrap_or(config.video.width),
            height: video.settings().height.unwrap_or(config.video.height),
            frame_rate: video.settings().frame_rate.unwrap_or(config.video.frame_rate),
            video_bitrate: config.bitrate.video,
            audio_bitrate: config.bitrate.audio,
        };
        let encoder = host
            .encoder
            .create(&settings)
            .map_err(|e| RecorderError::EncoderRuntime(format!("{e:#}")))?;

        let (pipeline_tx, pipeline_events) = mpsc::unbounded_channel();
        let pipeline = EncoderPipeline::start(
            &stream,
            encoder,
            mime_type,
            host.settings.pipeline_config(),
            pipeline_tx,
        );
        self.stage(generation, pipeline, |r, p| r.pipeline = Some(p))?;

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&self.shared),
            generation,
            pipeline_events,
            terminations,
        ));
        self.stage(generation, supervisor, |r, s| r.supervisor = Some(s))?;

        Ok(())
    }

    async fn start_compositor(
        &self,
        config: &RecorderConfig,
        primary: &Track,
        secondary: &Track,
    ) -> RecorderResult<Compositor> {
        let settings = &self.shared.host.settings;
        let mut compositor_config =
            CompositorConfig::new(config.video.width, config.video.height, config.video.frame_rate);
        compositor_config.ready_timeout = settings.ready_timeout();

        let device = if settings.compositor.accelerated {
            self.shared.host.accelerator.clone()
        } else {
            None
        };

        let events = self.shared.events.clone();
        let on_fallback: FallbackHook = Arc::new(move |reason: &CompositionError| {
            let _ = events.send(RecorderEvent::CompositorFallback {
                reason: reason.to_string(),
            });
        });

        Ok(Compositor::start(primary, secondary, compositor_config, device, on_fallback).await?)
    }

    /// Hand `item` to the session. If the session was stopped meanwhile the
    /// item is dropped, which releases it.
    fn stage<T>(
        &self,
        generation: u64,
        item: T,
        place: impl FnOnce(&mut Resources, T),
    ) -> RecorderResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation || inner.state != SessionState::Starting {
            return Err(SessionError::Cancelled.into());
        }
        place(&mut inner.resources, item);
        Ok(())
    }

    fn rollback(&self, generation: u64) -> usize {
        let mut resources = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || inner.state != SessionState::Starting {
                return 0;
            }
            inner.cancel = None;
            self.transition(&mut inner, SessionState::Idle);
            std::mem::take(&mut inner.resources)
        };
        resources.release_all()
    }

    /// Pause recording. No-op unless recording.
    pub fn pause(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != SessionState::Recording {
            debug!("Ignoring pause while {}", inner.state);
            return;
        }
        if let Some(pipeline) = &inner.resources.pipeline {
            pipeline.pause();
        }
        self.transition(&mut inner, SessionState::Paused);
        info!("Recording paused");
    }

    /// Resume recording. No-op unless paused.
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != SessionState::Paused {
            debug!("Ignoring resume while {}", inner.state);
            return;
        }
        if let Some(pipeline) = &inner.resources.pipeline {
            pipeline.resume();
        }
        self.transition(&mut inner, SessionState::Recording);
        info!("Recording resumed");
    }

    /// Stop the session and return its recording.
    ///
    /// Returns `None` when nothing was recording: idle without an unclaimed
    /// recording, a start that is cancelled by this call, or a stop that is
    /// already in progress.
    pub async fn stop(&self) -> RecorderResult<Option<Artifact>> {
        let (generation, resources) = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                SessionState::Idle => return Ok(inner.pending.take()),
                SessionState::Stopping => return Ok(None),
                SessionState::Starting => {
                    cancel(&mut inner);
                    let mut resources = std::mem::take(&mut inner.resources);
                    self.transition(&mut inner, SessionState::Idle);
                    drop(inner);
                    let released = resources.release_all();
                    info!("Start cancelled, released {} track(s)", released);
                    return Ok(None);
                }
                SessionState::Recording | SessionState::Paused | SessionState::Error => {
                    inner.cancel = None;
                    self.transition(&mut inner, SessionState::Stopping);
                    (inner.generation, std::mem::take(&mut inner.resources))
                }
            }
        };

        self.finish(generation, resources, false).await
    }

    /// Flush the pipeline, release everything and go idle. With `hold` the
    /// recording is kept for the next stop() instead of being returned.
    ///
    /// If `cleanup()` or a newer session took over meanwhile, the state and
    /// the unclaimed recording belong to them and are left untouched.
    async fn finish(
        &self,
        generation: u64,
        mut resources: Resources,
        hold: bool,
    ) -> RecorderResult<Option<Artifact>> {
        let supervisor = resources.supervisor.take();

        let result = match resources.pipeline.take() {
            Some(mut pipeline) => {
                let result = pipeline.stop().await;
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    inner.last_progress = pipeline.progress();
                }
                result
            }
            None => Ok(None),
        };

        let released = resources.release_sources();
        debug!("Released {} track(s)", released);

        // The pipeline task is done, so the supervisor drains the last
        // events and exits on its own
        if let Some(supervisor) = supervisor {
            if result.is_err() {
                supervisor.abort();
            } else if let Err(e) = supervisor.await {
                if !e.is_cancelled() {
                    warn!("Session supervisor ended abnormally: {}", e);
                }
            }
        }

        match &result {
            Ok(Some(artifact)) => info!(
                "Recording session stopped: {} bytes in {} chunks",
                artifact.size(),
                artifact.chunk_count
            ),
            Ok(None) => info!("Recording session stopped"),
            Err(e) => self.fail(e),
        }

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation || inner.state != SessionState::Stopping {
            debug!("Session {} was superseded while stopping", generation);
            return if hold { Ok(None) } else { result };
        }
        let result = match result {
            Ok(artifact) if hold => {
                inner.pending = artifact;
                Ok(None)
            }
            other => other,
        };
        self.transition(&mut inner, SessionState::Idle);
        result
    }

    /// Tear everything down and discard any recording. Safe to call at any
    /// time, any number of times. Returns false if there was nothing to do.
    pub fn cleanup(&self) -> bool {
        let mut resources = {
            let mut inner = self.shared.inner.lock();
            cancel(&mut inner);
            let discarded = inner.pending.take().is_some();
            let active = inner.state != SessionState::Idle;
            if !active && !discarded && inner.resources.is_empty() {
                return false;
            }
            // In-flight start() and stop() calls see they were superseded
            inner.generation += 1;
            self.transition(&mut inner, SessionState::Idle);
            std::mem::take(&mut inner.resources)
        };

        let released = resources.release_all();
        info!("Recorder cleaned up, released {} track(s)", released);
        true
    }

    /// The encoder failed: keep what was queued, drop the sources
    fn encoder_failed(&self, generation: u64, message: String) {
        let mut resources = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || !inner.state.is_active() {
                return;
            }
            self.transition(&mut inner, SessionState::Error);
            Resources {
                sources: std::mem::take(&mut inner.resources.sources),
                compositor: inner.resources.compositor.take(),
                audio: inner.resources.audio.take(),
                ..Default::default()
            }
        };

        let released = resources.release_sources();
        warn!("Encoder failed, released {} track(s); stop() returns the partial recording", released);
        self.fail(&RecorderError::EncoderRuntime(message));
    }

    /// A source ended outside the pipeline: stop on our own and keep the
    /// recording for the next stop()
    async fn source_ended(&self, generation: u64, reason: SessionError) {
        let resources = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            let state = inner.state;
            match state {
                SessionState::Recording | SessionState::Paused | SessionState::Error => {}
                _ => return,
            }
            // Running on the supervisor; it must not be aborted
            drop(inner.resources.supervisor.take());
            inner.cancel = None;
            self.transition(&mut inner, SessionState::Stopping);
            std::mem::take(&mut inner.resources)
        };

        warn!("Stopping session: {}", reason);
        if let Err(e) = self.finish(generation, resources, true).await {
            error!("Could not keep the recording: {}", e);
        }
        self.fail(&RecorderError::Session(reason));
    }
}

fn cancel(inner: &mut Inner) {
    if let Some(cancel) = inner.cancel.take() {
        let _ = cancel.send(true);
    }
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
    if cancelled.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn video_of(source: &AcquiredSource) -> RecorderResult<Track> {
    source.video_track().cloned().ok_or_else(|| {
        AcquisitionError::DeviceUnavailable {
            origin: source.origin(),
            detail: "source delivered no video track".to_string(),
        }
        .into()
    })
}

/// Forward pipeline events and react to sources ending
async fn supervise(
    shared: Weak<Shared>,
    generation: u64,
    mut pipeline_events: mpsc::UnboundedReceiver<PipelineEvent>,
    mut terminations: mpsc::UnboundedReceiver<SessionError>,
) {
    loop {
        tokio::select! {
            event = pipeline_events.recv() => {
                let Some(event) = event else { break };
                let Some(shared) = shared.upgrade() else { break };
                let recorder = Recorder { shared };
                match event {
                    PipelineEvent::DataAvailable { size } => {
                        recorder.emit(RecorderEvent::DataAvailable { size });
                    }
                    PipelineEvent::Error { message } => recorder.encoder_failed(generation, message),
                }
            }
            Some(reason) = terminations.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                Recorder { shared }.source_ended(generation, reason).await;
            }
        }
    }
    debug!("Session {} supervisor finished", generation);
}
