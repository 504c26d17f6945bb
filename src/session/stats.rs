use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::CaptureMode;
use super::state::SessionState;
use crate::compositor::CompositorVariant;

/// Snapshot of a recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub state: SessionState,

    /// Mode of the current or last session
    pub mode: Option<CaptureMode>,

    /// When recording started
    pub started_at: Option<DateTime<Utc>>,

    /// Wall-clock time since `started_at`, in seconds
    pub duration_secs: f64,

    /// Negotiated container/codec identifier
    pub mime_type: Option<String>,

    /// Chunks emitted so far, including evicted ones
    pub chunks_count: u64,

    /// Bytes currently held by the chunk queue
    pub bytes_queued: usize,

    /// Chunks dropped because the queue was full
    pub chunks_evicted: u64,

    /// Active compositor variant in combined mode
    pub compositor: Option<CompositorVariant>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            mode: None,
            started_at: None,
            duration_secs: 0.0,
            mime_type: None,
            chunks_count: 0,
            bytes_queued: 0,
            chunks_evicted: 0,
            compositor: None,
        }
    }
}
