//! Media primitives shared by every stage of the pipeline

pub mod frame;
pub mod track;

pub use frame::{AudioFrame, FramePool, FrameSlot, VideoFrame};
pub use track::{
    FrameReader, MediaStream, Origin, Track, TrackEnd, TrackKind, TrackSettings, TrackSink,
};
