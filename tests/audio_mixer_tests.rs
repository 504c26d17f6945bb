// Integration tests for the audio mixer
//
// These tests feed hand-made frames through real audio tracks and check
// what comes out of the mix.

use anyhow::Result;
use dual_recorder::audio::{select_inputs, AudioMixer};
use dual_recorder::media::{AudioFrame, Origin, Track, TrackSettings, TrackSink};
use dual_recorder::session::{AudioFlags, CaptureMode};
use std::time::Duration;

fn audio_track(origin: Origin, sample_rate: u32) -> (Track, TrackSink<AudioFrame>) {
    Track::audio(origin, format!("{origin} audio"), TrackSettings::audio(sample_rate, 1), 16)
}

fn frame(origin: Origin, value: i16, timestamp_ms: u64) -> AudioFrame {
    AudioFrame {
        samples: vec![value; 480],
        sample_rate: 48000,
        channels: 1,
        timestamp_ms,
        origin,
    }
}

#[tokio::test]
async fn test_two_inputs_are_summed() -> Result<()> {
    let (system, system_sink) = audio_track(Origin::Primary, 48000);
    let (mic, mic_sink) = audio_track(Origin::Secondary, 48000);

    let mut mixed = AudioMixer::default().build(vec![system.clone(), mic.clone()]);
    assert!(!mixed.is_passthrough());
    let track = mixed.track().cloned().expect("mixed track");
    assert_eq!(track.origin(), Origin::Mixed);

    let mut reader = track.audio_reader().await.expect("audio reader");

    assert!(system_sink.send(frame(Origin::Primary, 1000, 0)).await);
    assert!(mic_sink.send(frame(Origin::Secondary, 250, 0)).await);

    let out = tokio::time::timeout(Duration::from_secs(1), reader.read())
        .await?
        .expect("mixed frame");
    assert_eq!(out.origin, Origin::Mixed);
    assert_eq!(out.samples.len(), 480);
    assert!(out.samples.iter().all(|&s| s == 1250));

    mixed.stop();
    assert!(track.is_released());
    assert!(system.is_live() && mic.is_live(), "inputs belong to their sources");
    Ok(())
}

#[tokio::test]
async fn test_single_input_passes_through() -> Result<()> {
    let (mic, _sink) = audio_track(Origin::Secondary, 48000);

    let mut mixed = AudioMixer::default().build(vec![mic.clone()]);
    assert!(mixed.is_passthrough());
    assert_eq!(mixed.track(), Some(&mic));

    mixed.stop();
    assert!(mic.is_live(), "stopping a passthrough must not release the source");
    Ok(())
}

#[tokio::test]
async fn test_no_inputs_means_no_audio() {
    let mixed = AudioMixer::default().build(Vec::new());
    assert!(mixed.track().is_none());
}

#[tokio::test]
async fn test_mismatched_formats_pass_first_input_through() {
    let (system, _a) = audio_track(Origin::Primary, 48000);
    let (mic, _b) = audio_track(Origin::Secondary, 16000);

    let mixed = AudioMixer::default().build(vec![system.clone(), mic]);
    assert!(mixed.is_passthrough());
    assert_eq!(mixed.track(), Some(&system));
}

#[tokio::test]
async fn test_mix_continues_after_one_input_ends() -> Result<()> {
    let (system, system_sink) = audio_track(Origin::Primary, 48000);
    let (mic, mic_sink) = audio_track(Origin::Secondary, 48000);

    let mixed = AudioMixer::default().build(vec![system, mic]);
    let track = mixed.track().cloned().expect("mixed track");
    let mut reader = track.audio_reader().await.expect("audio reader");

    drop(mic_sink);
    assert!(system_sink.send(frame(Origin::Primary, 42, 0)).await);

    let out = tokio::time::timeout(Duration::from_secs(1), reader.read())
        .await?
        .expect("frame emitted alone");
    assert!(out.samples.iter().all(|&s| s == 42));
    assert_eq!(out.origin, Origin::Mixed);
    Ok(())
}

#[test]
fn test_input_selection_follows_mode() {
    let (system, _a) = audio_track(Origin::Primary, 48000);
    let (mic, _b) = audio_track(Origin::Secondary, 48000);
    let flags = AudioFlags::default();

    let inputs = select_inputs(CaptureMode::Combined, &flags, Some(&system), Some(&mic));
    assert_eq!(inputs, vec![system.clone(), mic.clone()]);

    // System audio rides on the display source
    let inputs = select_inputs(CaptureMode::SecondaryOnly, &flags, Some(&system), Some(&mic));
    assert_eq!(inputs, vec![mic.clone()]);

    let no_mic = AudioFlags {
        primary: true,
        secondary: false,
    };
    let inputs = select_inputs(CaptureMode::Combined, &no_mic, Some(&system), Some(&mic));
    assert_eq!(inputs, vec![system]);
}
