pub mod audio;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod encoder;
pub mod error;
pub mod media;
pub mod session;

pub use capture::{CaptureBackend, Constraints, SyntheticBackend, SyntheticOptions};
pub use compositor::{AccelerationDevice, CompositorVariant, IsolatedDevice};
pub use config::Settings;
pub use encoder::{Artifact, EncoderHost, FrameEncoder, SegmentEncoderHost};
pub use error::{AcquisitionError, CompositionError, RecorderError, RecorderResult, SessionError};
pub use media::{AudioFrame, MediaStream, Origin, Track, VideoFrame};
pub use session::{
    CaptureMode, HostContext, Recorder, RecorderConfig, RecorderEvent, SessionState, SessionStats,
};
