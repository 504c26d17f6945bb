//! Error types
//!
//! Every failure the recorder reports to its caller is one of these.

use std::time::Duration;
use thiserror::Error;

use crate::media::Origin;

/// A source could not be obtained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("permission denied for the {origin} source")]
    PermissionDenied { origin: Origin },

    #[error("no {origin} device available: {detail}")]
    DeviceUnavailable { origin: Origin, detail: String },

    #[error("{origin} source is not supported by the {backend} backend")]
    Unsupported { origin: Origin, backend: String },
}

impl AcquisitionError {
    pub fn origin(&self) -> Origin {
        match self {
            AcquisitionError::PermissionDenied { origin }
            | AcquisitionError::DeviceUnavailable { origin, .. }
            | AcquisitionError::Unsupported { origin, .. } => *origin,
        }
    }
}

/// The compositor could not produce frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("accelerated compositor not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("acceleration device failed: {0}")]
    Device(String),

    #[error("compositor failed while running: {0}")]
    Runtime(String),

    #[error("compositor input unavailable: {0}")]
    Input(String),
}

/// Session-level termination or misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("the {origin} source ended")]
    SourceEnded { origin: Origin },

    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("start was cancelled by a concurrent stop or cleanup")]
    Cancelled,
}

/// Error surfaced by the recorder
#[derive(Error, Debug, Clone)]
pub enum RecorderError {
    #[error("acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("composition failed: {0}")]
    Composition(#[from] CompositionError),

    #[error("no supported recording format (tried {})", tried.join(", "))]
    UnsupportedFormat { tried: Vec<String> },

    #[error("encoder failed: {0}")]
    EncoderRuntime(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RecorderError {
    /// Stable code for event consumers
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::Acquisition(_) => "ACQUISITION_ERROR",
            RecorderError::Composition(_) => "COMPOSITION_ERROR",
            RecorderError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            RecorderError::EncoderRuntime(_) => "ENCODER_RUNTIME_ERROR",
            RecorderError::Session(_) => "SESSION_ERROR",
            RecorderError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Whether a fresh `start()` may succeed without changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecorderError::Acquisition(_) | RecorderError::Session(SessionError::Cancelled)
        )
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_messages() {
        let err = RecorderError::from(AcquisitionError::PermissionDenied {
            origin: Origin::Primary,
        });
        assert_eq!(err.code(), "ACQUISITION_ERROR");
        assert!(err.to_string().contains("primary"));
        assert!(err.is_retryable());

        let err = RecorderError::UnsupportedFormat {
            tried: vec!["video/webm".into(), "video/mp4".into()],
        };
        assert_eq!(
            err.to_string(),
            "no supported recording format (tried video/webm, video/mp4)"
        );
        assert!(!err.is_retryable());
    }
}
