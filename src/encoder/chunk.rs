use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Default queue capacity
pub const DEFAULT_MAX_CHUNKS: usize = 1000;

/// One encoded segment produced at a flush boundary
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position in capture order (0-indexed, never reused)
    pub index: u64,
    /// Encoded bytes
    pub data: Vec<u8>,
    /// When the chunk was flushed
    pub captured_at: DateTime<Utc>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounded FIFO of chunks.
///
/// Pushing past capacity evicts the oldest chunk; pushing never blocks.
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    capacity: usize,
    next_index: u64,
    evicted: u64,
    bytes: usize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            next_index: 0,
            evicted: 0,
            bytes: 0,
        }
    }

    /// Append `data` as the next chunk. Returns the evicted chunk, if any.
    pub fn push(&mut self, data: Vec<u8>) -> Option<Chunk> {
        let evicted = if self.chunks.len() >= self.capacity {
            let oldest = self.chunks.pop_front();
            if let Some(oldest) = &oldest {
                self.bytes -= oldest.len();
                self.evicted += 1;
                warn!(
                    "Chunk queue full ({}), dropped chunk {} ({})",
                    self.capacity,
                    oldest.index,
                    ByteCount(oldest.len())
                );
            }
            oldest
        } else {
            None
        };

        self.bytes += data.len();
        self.chunks.push_back(Chunk {
            index: self.next_index,
            data,
            captured_at: Utc::now(),
        });
        self.next_index += 1;

        evicted
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }

    /// Chunks dropped to stay within capacity
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Chunks ever pushed
    pub fn pushed(&self) -> u64 {
        self.next_index
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Concatenate every queued chunk in order
    pub fn into_artifact(self, mime_type: impl Into<String>, duration: Duration) -> Artifact {
        let mut data = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            data.extend_from_slice(&chunk.data);
        }

        Artifact {
            mime_type: mime_type.into(),
            data,
            chunk_count: self.chunks.len(),
            evicted_chunks: self.evicted,
            duration,
        }
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNKS)
    }
}

/// The assembled recording
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Negotiated container/codec identifier
    pub mime_type: String,
    /// In-order concatenation of the queued chunks
    pub data: Vec<u8>,
    /// Chunks that went into `data`
    pub chunk_count: usize,
    /// Chunks lost to queue eviction
    pub evicted_chunks: u64,
    /// Recorded time, excluding pauses
    pub duration: Duration,
}

impl Artifact {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Nothing was captured. Not an error.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Human readable byte count for logs
pub struct ByteCount(pub usize);

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0 as f64;
        if bytes >= 1024.0 * 1024.0 {
            write!(f, "{:.1} MiB", bytes / (1024.0 * 1024.0))
        } else if bytes >= 1024.0 {
            write!(f, "{:.1} KiB", bytes / 1024.0)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}
