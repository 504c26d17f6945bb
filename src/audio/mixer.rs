// Audio mixer for combining the primary and secondary audio tracks
//
// This module merges up to two audio tracks into at most one:
// - System audio (travels with the primary/display source)
// - Microphone audio (travels with the secondary/camera source)
//
// Each source is connected to the mix at unity gain. The mixer buffers
// frames per source, pairs them in arrival order, and sums the samples with
// clipping. No ducking or normalization.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::{AudioFrame, FrameReader, Origin, Track, TrackKind, TrackSettings, TrackSink};
use crate::session::{AudioFlags, CaptureMode};

/// Configuration for audio mixer
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Maximum buffering delay in milliseconds (default: 200ms)
    /// A frame waiting longer than this for its partner is emitted alone
    pub max_buffer_delay_ms: u64,
    /// Frames buffered on the mixed output track
    pub output_capacity: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_buffer_delay_ms: 200,
            output_capacity: 64,
        }
    }
}

/// Pick the audio tracks that take part in the mix.
///
/// System audio rides on the primary source and is excluded in
/// secondary-only mode; microphone audio is excluded in primary-only mode.
pub fn select_inputs(
    mode: CaptureMode,
    flags: &AudioFlags,
    primary_audio: Option<&Track>,
    secondary_audio: Option<&Track>,
) -> Vec<Track> {
    let mut inputs = Vec::new();

    if flags.primary && mode != CaptureMode::SecondaryOnly {
        if let Some(track) = primary_audio {
            inputs.push(track.clone());
        }
    }
    if flags.secondary && mode != CaptureMode::PrimaryOnly {
        if let Some(track) = secondary_audio {
            inputs.push(track.clone());
        }
    }

    inputs
}

/// Unity-gain connections from every input into one destination
#[derive(Debug, Clone)]
struct MixGraph {
    inputs: Vec<Track>,
    sample_rate: u32,
    channels: u16,
}

impl MixGraph {
    fn connect(inputs: &[Track]) -> Result<Self> {
        let mut format = None;
        for track in inputs {
            if track.kind() != TrackKind::Audio {
                bail!("{} track is not an audio track", track.origin());
            }
            let settings = track.settings();
            let (Some(rate), Some(channels)) = (settings.sample_rate, settings.channels) else {
                bail!("{} audio track has no sample format", track.origin());
            };
            match format {
                None => format = Some((rate, channels)),
                Some(existing) if existing != (rate, channels) => {
                    bail!(
                        "cannot connect {} audio ({}Hz, {}ch) to a {}Hz, {}ch mix",
                        track.origin(),
                        rate,
                        channels,
                        existing.0,
                        existing.1
                    );
                }
                Some(_) => {}
            }
        }

        let Some((sample_rate, channels)) = format else {
            bail!("no inputs to connect");
        };

        Ok(Self {
            inputs: inputs.to_vec(),
            sample_rate,
            channels,
        })
    }
}

/// Result of building the mix
#[derive(Debug, Default)]
pub struct MixedAudio {
    track: Option<Track>,
    task: Option<JoinHandle<()>>,
    passthrough: bool,
}

impl MixedAudio {
    /// The audio track to record, if any
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// True when an input is forwarded as-is instead of being mixed
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Stop mixing and release the mixed track. Passthrough tracks belong
    /// to their source and are left alone.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(track) = &self.track {
            if track.origin() == Origin::Mixed {
                track.stop();
            }
        }
    }
}

impl Drop for MixedAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Audio mixer that combines the selected audio tracks
pub struct AudioMixer {
    config: MixerConfig,
}

impl AudioMixer {
    pub fn new(config: MixerConfig) -> Self {
        Self { config }
    }

    /// Build the mix for `inputs`.
    ///
    /// Zero inputs produce no track, one input is forwarded unchanged, and
    /// two or more are mixed into a new track. If the inputs cannot be
    /// connected, the first one is forwarded unmixed.
    pub fn build(&self, inputs: Vec<Track>) -> MixedAudio {
        match inputs.len() {
            0 => {
                info!("No audio inputs selected, recording without audio");
                MixedAudio::default()
            }
            1 => {
                let track = inputs.into_iter().next();
                MixedAudio {
                    track,
                    task: None,
                    passthrough: true,
                }
            }
            _ => match MixGraph::connect(&inputs) {
                Ok(graph) => self.spawn(graph),
                Err(e) => {
                    warn!("Audio mix unavailable, passing the first input through: {}", e);
                    MixedAudio {
                        track: inputs.into_iter().next(),
                        task: None,
                        passthrough: true,
                    }
                }
            },
        }
    }

    fn spawn(&self, graph: MixGraph) -> MixedAudio {
        info!(
            "Audio mixer initialized: {}Hz, {} channels, {} inputs",
            graph.sample_rate,
            graph.channels,
            graph.inputs.len()
        );

        let settings = TrackSettings::audio(graph.sample_rate, graph.channels);
        let (track, sink) = Track::audio(
            Origin::Mixed,
            "Mixed Audio",
            settings,
            self.config.output_capacity,
        );
        let state = MixState::new(self.config.clone(), &graph);
        let task = tokio::spawn(run_mix(graph.inputs, sink, state));

        MixedAudio {
            track: Some(track),
            task: Some(task),
            passthrough: false,
        }
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(MixerConfig::default())
    }
}

async fn run_mix(inputs: Vec<Track>, sink: TrackSink<AudioFrame>, mut state: MixState) {
    let mut readers: Vec<(Origin, FrameReader<AudioFrame>)> = Vec::new();
    for track in &inputs {
        if let Some(reader) = track.audio_reader().await {
            readers.push((track.origin(), reader));
        }
    }
    let mut readers = readers.into_iter();
    let (Some((first_origin, mut first)), Some((second_origin, mut second))) =
        (readers.next(), readers.next())
    else {
        return;
    };

    let mut first_open = true;
    let mut second_open = true;
    let mut produced: u64 = 0;

    info!("Starting audio mixing");

    while first_open || second_open {
        tokio::select! {
            _ = sink.stopped() => break,
            frame = first.read(), if first_open => match frame {
                Some(frame) => state.buffer_frame(frame),
                None => {
                    first_open = false;
                    state.close(first_origin);
                }
            },
            frame = second.read(), if second_open => match frame {
                Some(frame) => state.buffer_frame(frame),
                None => {
                    second_open = false;
                    state.close(second_origin);
                }
            },
        }

        while let Some(mixed) = state.mix_next_chunk() {
            if !sink.send(mixed).await {
                return;
            }
            produced += 1;
        }
    }

    info!("Audio mixing complete: {} mixed frames produced", produced);
}

/// Per-source buffers and the pairing logic
struct MixState {
    config: MixerConfig,
    sample_rate: u32,
    channels: u16,
    buffers: HashMap<Origin, VecDeque<AudioFrame>>,
    closed: HashSet<Origin>,
}

impl MixState {
    fn new(config: MixerConfig, graph: &MixGraph) -> Self {
        let buffers = graph
            .inputs
            .iter()
            .map(|t| (t.origin(), VecDeque::new()))
            .collect();
        Self {
            config,
            sample_rate: graph.sample_rate,
            channels: graph.channels,
            buffers,
            closed: HashSet::new(),
        }
    }

    fn close(&mut self, origin: Origin) {
        debug!("{} audio input ended", origin);
        self.closed.insert(origin);
    }

    /// Buffer a frame based on its origin
    fn buffer_frame(&mut self, frame: AudioFrame) {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            warn!(
                "Dropping {} frame with format {}Hz/{}ch (mix is {}Hz/{}ch)",
                frame.origin, frame.sample_rate, frame.channels, self.sample_rate, self.channels
            );
            return;
        }

        if let Some(buffer) = self.buffers.get_mut(&frame.origin) {
            buffer.push_back(frame);
        }
    }

    /// Produce the next output frame if one is due.
    ///
    /// One frame from each source is summed when all sources have data. A
    /// frame is emitted alone when its partner source has ended or has
    /// fallen more than `max_buffer_delay_ms` behind.
    fn mix_next_chunk(&mut self) -> Option<AudioFrame> {
        let all_ready = self.buffers.values().all(|b| !b.is_empty());
        if all_ready {
            let frames: Vec<AudioFrame> = self
                .buffers
                .values_mut()
                .filter_map(|b| b.pop_front())
                .collect();
            return Some(mix_frames(&frames, self.sample_rate, self.channels));
        }

        let newest = self
            .buffers
            .values()
            .filter_map(|b| b.back())
            .map(|f| f.timestamp_ms)
            .max()?;

        let due = self.buffers.iter().find_map(|(origin, buffer)| {
            let front = buffer.front()?;
            let partner_gone = self
                .buffers
                .iter()
                .any(|(other, b)| other != origin && b.is_empty() && self.closed.contains(other));
            let waited_too_long =
                newest.saturating_sub(front.timestamp_ms) > self.config.max_buffer_delay_ms;
            (partner_gone || waited_too_long).then_some(*origin)
        })?;

        let frame = self.buffers.get_mut(&due)?.pop_front()?;
        Some(AudioFrame {
            origin: Origin::Mixed,
            ..frame
        })
    }
}

/// Sum frames sample by sample with clipping; the output is as long as the
/// longest input and carries the earliest timestamp
fn mix_frames(frames: &[AudioFrame], sample_rate: u32, channels: u16) -> AudioFrame {
    let timestamp_ms = frames.iter().map(|f| f.timestamp_ms).min().unwrap_or(0);
    let max_len = frames.iter().map(|f| f.samples.len()).max().unwrap_or(0);

    let mut samples = Vec::with_capacity(max_len);
    for i in 0..max_len {
        let sum: i32 = frames
            .iter()
            .map(|f| f.samples.get(i).copied().unwrap_or(0) as i32)
            .sum();
        samples.push(sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    }

    AudioFrame {
        samples,
        sample_rate,
        channels,
        timestamp_ms,
        origin: Origin::Mixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<i16>, origin: Origin, timestamp_ms: u64) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 48000,
            channels: 1,
            timestamp_ms,
            origin,
        }
    }

    fn state() -> MixState {
        let (a, _) = Track::audio(Origin::Primary, "a", TrackSettings::audio(48000, 1), 4);
        let (b, _) = Track::audio(Origin::Secondary, "b", TrackSettings::audio(48000, 1), 4);
        let graph = MixGraph::connect(&[a, b]).unwrap();
        MixState::new(MixerConfig::default(), &graph)
    }

    #[test]
    fn test_mix_frames_equal_length() {
        let frames = vec![
            frame(vec![100, 200, 300], Origin::Primary, 0),
            frame(vec![50, 100, 150], Origin::Secondary, 0),
        ];
        let mixed = mix_frames(&frames, 48000, 1);

        assert_eq!(mixed.samples, vec![150, 300, 450]);
        assert_eq!(mixed.origin, Origin::Mixed);
    }

    #[test]
    fn test_mix_frames_with_clipping() {
        let frames = vec![
            frame(vec![i16::MAX - 100, i16::MIN + 10], Origin::Primary, 0),
            frame(vec![200, -200], Origin::Secondary, 0),
        ];
        let mixed = mix_frames(&frames, 48000, 1);

        assert_eq!(mixed.samples, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_mix_frames_different_lengths() {
        let frames = vec![
            frame(vec![100, 200], Origin::Primary, 40),
            frame(vec![50, 100, 150, 200], Origin::Secondary, 20),
        ];
        let mixed = mix_frames(&frames, 48000, 1);

        assert_eq!(mixed.samples, vec![150, 300, 150, 200]);
        assert_eq!(mixed.timestamp_ms, 20, "earliest timestamp wins");
    }

    #[test]
    fn test_waits_for_partner_within_delay() {
        let mut state = state();
        state.buffer_frame(frame(vec![1; 4], Origin::Primary, 0));
        state.buffer_frame(frame(vec![1; 4], Origin::Primary, 100));
        assert!(state.mix_next_chunk().is_none());

        state.buffer_frame(frame(vec![2; 4], Origin::Secondary, 0));
        let mixed = state.mix_next_chunk().unwrap();
        assert_eq!(mixed.samples, vec![3; 4]);
    }

    #[test]
    fn test_emits_alone_when_partner_lags() {
        let mut state = state();
        state.buffer_frame(frame(vec![7; 4], Origin::Primary, 0));
        state.buffer_frame(frame(vec![7; 4], Origin::Primary, 300));

        let alone = state.mix_next_chunk().unwrap();
        assert_eq!(alone.samples, vec![7; 4]);
        assert_eq!(alone.timestamp_ms, 0);
        assert_eq!(alone.origin, Origin::Mixed);
    }

    #[test]
    fn test_emits_alone_after_partner_closed() {
        let mut state = state();
        state.close(Origin::Secondary);
        state.buffer_frame(frame(vec![5; 4], Origin::Primary, 0));

        assert!(state.mix_next_chunk().is_some());
        assert!(state.mix_next_chunk().is_none());
    }

    #[test]
    fn test_select_inputs_gates_by_mode_and_flags() {
        let (system, _) = Track::audio(Origin::Primary, "sys", TrackSettings::audio(48000, 1), 1);
        let (mic, _) = Track::audio(Origin::Secondary, "mic", TrackSettings::audio(48000, 1), 1);
        let both = AudioFlags { primary: true, secondary: true };

        let inputs = select_inputs(CaptureMode::Combined, &both, Some(&system), Some(&mic));
        assert_eq!(inputs.len(), 2);

        let inputs = select_inputs(CaptureMode::SecondaryOnly, &both, Some(&system), Some(&mic));
        assert_eq!(inputs, vec![mic.clone()]);

        let inputs = select_inputs(CaptureMode::PrimaryOnly, &both, Some(&system), Some(&mic));
        assert_eq!(inputs, vec![system.clone()]);

        let mic_only = AudioFlags { primary: false, secondary: true };
        let inputs = select_inputs(CaptureMode::Combined, &mic_only, Some(&system), Some(&mic));
        assert_eq!(inputs, vec![mic]);
    }
}
