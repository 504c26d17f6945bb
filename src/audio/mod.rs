pub mod mixer;

pub use mixer::{select_inputs, AudioMixer, MixedAudio, MixerConfig};
