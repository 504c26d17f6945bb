use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Paused,
    Stopping,
    Error,
}

impl SessionState {
    /// Holding sources or an encoder
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Recording | SessionState::Paused
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications published to subscribers of a recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecorderEvent {
    /// A chunk of `size` bytes was queued
    DataAvailable { size: usize },
    /// The session hit a fatal condition; `code` is the error's stable code
    Error { code: String, message: String },
    StateChanged { state: SessionState },
    /// Composition moved to the software path
    CompositorFallback { reason: String },
}
