use serde::{Deserialize, Serialize};

use crate::capture::Constraints;
use crate::error::{RecorderError, RecorderResult};

/// Which sources a session records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    /// Display only
    #[serde(alias = "primary", alias = "screen")]
    PrimaryOnly,
    /// Camera only
    #[serde(alias = "secondary", alias = "camera")]
    SecondaryOnly,
    /// Display with the camera as an inset
    #[serde(alias = "both")]
    Combined,
}

/// Target video geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
        }
    }
}

/// Per-origin audio switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFlags {
    /// System audio from the display source
    pub primary: bool,
    /// Microphone audio from the camera source
    pub secondary: bool,
}

impl Default for AudioFlags {
    fn default() -> Self {
        Self {
            primary: true,
            secondary: true,
        }
    }
}

/// Encoder bitrates in bits per second
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bitrate {
    pub video: u32,
    pub audio: u32,
}

impl Default for Bitrate {
    fn default() -> Self {
        Self {
            video: 5_000_000,
            audio: 128_000,
        }
    }
}

/// Configuration for one recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderConfig {
    pub mode: CaptureMode,

    #[serde(default)]
    pub video: VideoSettings,

    #[serde(default)]
    pub audio: AudioFlags,

    #[serde(default)]
    pub bitrate: Bitrate,

    /// Device to open for the secondary (camera) source
    #[serde(default)]
    pub device_selector: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Combined,
            video: VideoSettings::default(),
            audio: AudioFlags::default(),
            bitrate: Bitrate::default(),
            device_selector: None,
        }
    }
}

impl RecorderConfig {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "video size must be non-zero, got {}x{}",
                self.video.width, self.video.height
            )));
        }
        if !(self.video.frame_rate.is_finite() && self.video.frame_rate > 0.0) {
            return Err(RecorderError::InvalidConfig(format!(
                "frame rate must be positive, got {}",
                self.video.frame_rate
            )));
        }
        if self.bitrate.video == 0 {
            return Err(RecorderError::InvalidConfig("video bitrate must be non-zero".into()));
        }
        Ok(())
    }

    /// Constraints for the display source
    pub fn primary_constraints(&self) -> Constraints {
        Constraints {
            width: self.video.width,
            height: self.video.height,
            frame_rate: self.video.frame_rate,
            audio: self.audio.primary && self.mode != CaptureMode::SecondaryOnly,
            device_id: None,
        }
    }

    /// Constraints for the camera source
    pub fn secondary_constraints(&self) -> Constraints {
        Constraints {
            width: self.video.width,
            height: self.video.height,
            frame_rate: self.video.frame_rate,
            audio: self.audio.secondary && self.mode != CaptureMode::PrimaryOnly,
            device_id: self.device_selector.clone(),
        }
    }
}
