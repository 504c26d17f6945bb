//! Codec negotiation and the encoder seam
//!
//! The host decides which container/codec identifiers it can produce. The
//! recorder walks its preference list and takes the first one supported.

use anyhow::Result;
use tracing::{debug, info};

use crate::error::{RecorderError, RecorderResult};
use crate::media::{AudioFrame, VideoFrame};

/// Preference list used when the settings do not name one
pub const DEFAULT_CODEC_PREFERENCES: &[&str] = &[
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/mp4",
    super::segment::MJPEG_SEGMENT_MIME,
];

/// Parameters for one encoder instance
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Video bitrate in bits per second
    pub video_bitrate: u32,
    /// Audio bitrate in bits per second
    pub audio_bitrate: u32,
}

/// Encodes frames and hands out the bytes produced since the last flush
pub trait FrameEncoder: Send {
    fn encode_video(&mut self, frame: &VideoFrame) -> Result<()>;

    fn encode_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Close the current segment. The returned bytes decode on their own;
    /// empty when nothing was encoded since the last flush.
    fn flush(&mut self) -> Result<Vec<u8>>;
}

/// Platform encoder factory
pub trait EncoderHost: Send + Sync {
    fn name(&self) -> &str;

    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>>;
}

/// Pick the first identifier in `preferences` that `host` supports
pub fn negotiate<S: AsRef<str>>(host: &dyn EncoderHost, preferences: &[S]) -> RecorderResult<String> {
    for candidate in preferences {
        let candidate = candidate.as_ref();
        if host.is_type_supported(candidate) {
            info!("Negotiated recording format {} on {}", candidate, host.name());
            return Ok(candidate.to_string());
        }
        debug!("{} does not support {}", host.name(), candidate);
    }

    Err(RecorderError::UnsupportedFormat {
        tried: preferences.iter().map(|p| p.as_ref().to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnlySupports(&'static str);

    impl EncoderHost for OnlySupports {
        fn name(&self) -> &str {
            "test host"
        }

        fn is_type_supported(&self, mime_type: &str) -> bool {
            mime_type == self.0
        }

        fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>> {
            anyhow::bail!("not used")
        }
    }

    #[test]
    fn test_first_supported_wins() {
        let host = OnlySupports("z");
        assert_eq!(negotiate(&host, &["x", "y", "z"]).unwrap(), "z");
    }

    #[test]
    fn test_preference_order_is_respected() {
        struct Everything;
        impl EncoderHost for Everything {
            fn name(&self) -> &str {
                "everything"
            }
            fn is_type_supported(&self, _mime_type: &str) -> bool {
                true
            }
            fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>> {
                anyhow::bail!("not used")
            }
        }
        assert_eq!(
            negotiate(&Everything, DEFAULT_CODEC_PREFERENCES).unwrap(),
            "video/webm;codecs=vp9,opus"
        );
    }

    #[test]
    fn test_none_supported_is_fatal() {
        let host = OnlySupports("video/ogg");
        let err = negotiate(&host, &["x", "y"]).unwrap_err();
        match err {
            RecorderError::UnsupportedFormat { tried } => assert_eq!(tried, vec!["x", "y"]),
            other => panic!("unexpected error: {other}"),
        }
    }
}
