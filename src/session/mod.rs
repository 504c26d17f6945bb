//! Recording session management
//!
//! - `RecorderConfig`: what one session records
//! - `Recorder`: the session state machine and resource owner
//! - `SessionStats` and `RecorderEvent`: what callers can observe

mod config;
mod controller;
mod state;
mod stats;

pub use config::{AudioFlags, Bitrate, CaptureMode, RecorderConfig, VideoSettings};
pub use controller::{HostContext, Recorder};
pub use state::{RecorderEvent, SessionState};
pub use stats::SessionStats;
