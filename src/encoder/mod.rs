//! Encoding: codec negotiation, the segment encoder, the chunk queue and the
//! pipeline task tying them together.

pub mod chunk;
pub mod codec;
pub mod pipeline;
pub mod segment;

pub use chunk::{Artifact, ByteCount, Chunk, ChunkQueue, DEFAULT_MAX_CHUNKS};
pub use codec::{negotiate, EncoderHost, EncoderSettings, FrameEncoder, DEFAULT_CODEC_PREFERENCES};
pub use pipeline::{
    EncoderPipeline, PipelineConfig, PipelineEvent, PipelineProgress, PipelineState,
    DEFAULT_FLUSH_INTERVAL,
};
pub use segment::{read_segment, read_segments, SegmentEncoderHost, SegmentInfo, MJPEG_SEGMENT_MIME};
