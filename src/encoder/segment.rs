//! Built-in segment encoder
//!
//! Each flush closes one self-contained segment:
//!
//! ```text
//! magic "DRSG" | version u16 | width u32 | height u32 | frame_count u32
//! frame_count x (timestamp_ms u64 | jpeg_len u32 | jpeg bytes)
//! audio_len u32 | WAV bytes (absent when audio_len is 0)
//! ```
//!
//! All integers are little endian. Segments concatenate into a valid
//! recording and any one of them decodes on its own.

use anyhow::{bail, ensure, Context, Result};
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use super::codec::{EncoderHost, EncoderSettings, FrameEncoder};
use crate::media::{AudioFrame, VideoFrame};

/// Container identifier produced by [`SegmentEncoderHost`]
pub const MJPEG_SEGMENT_MIME: &str = "video/x-motion-jpeg;codecs=mjpeg,pcm";

const SEGMENT_MAGIC: &[u8; 4] = b"DRSG";
const SEGMENT_VERSION: u16 = 1;
const MIN_QUALITY: u8 = 30;
const MAX_QUALITY: u8 = 95;

/// Encoder host that only produces motion-JPEG segments
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentEncoderHost;

impl EncoderHost for SegmentEncoderHost {
    fn name(&self) -> &str {
        "segment encoder"
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        mime_type == MJPEG_SEGMENT_MIME
    }

    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn FrameEncoder>> {
        if !self.is_type_supported(&settings.mime_type) {
            bail!("segment encoder cannot produce {}", settings.mime_type);
        }
        Ok(Box::new(MjpegSegmentEncoder::new(settings)))
    }
}

/// JPEG quality for a bitrate budget, from the bits available per pixel
pub fn jpeg_quality(settings: &EncoderSettings) -> u8 {
    let pixels_per_second =
        settings.width as f64 * settings.height as f64 * settings.frame_rate.max(1.0);
    if pixels_per_second <= 0.0 {
        return MAX_QUALITY;
    }
    let bits_per_pixel = settings.video_bitrate as f64 / pixels_per_second;
    let quality = MIN_QUALITY as f64 + bits_per_pixel * 300.0;
    quality.clamp(MIN_QUALITY as f64, MAX_QUALITY as f64) as u8
}

struct PendingAudio {
    sample_rate: u32,
    channels: u16,
    samples: Vec<i16>,
}

pub struct MjpegSegmentEncoder {
    width: u32,
    height: u32,
    quality: u8,
    frames: Vec<(u64, Vec<u8>)>,
    audio: Option<PendingAudio>,
    segments: u64,
}

impl MjpegSegmentEncoder {
    pub fn new(settings: &EncoderSettings) -> Self {
        let quality = jpeg_quality(settings);
        debug!(
            "Segment encoder {}x{} at JPEG quality {}",
            settings.width, settings.height, quality
        );
        Self {
            width: settings.width,
            height: settings.height,
            quality,
            frames: Vec::new(),
            audio: None,
            segments: 0,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn has_pending(&self) -> bool {
        !self.frames.is_empty() || self.audio.as_ref().is_some_and(|a| !a.samples.is_empty())
    }

    fn encode_wav(audio: &PendingAudio) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: audio.channels,
            sample_rate: audio.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).context("Failed to start WAV segment")?;
            for &sample in &audio.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            writer.finalize().context("Failed to finalize WAV segment")?;
        }
        Ok(cursor.into_inner())
    }
}

impl FrameEncoder for MjpegSegmentEncoder {
    fn encode_video(&mut self, frame: &VideoFrame) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            bail!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }

        let rgb: RgbImage = frame.image().convert();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .context("Failed to encode JPEG frame")?;

        let timestamp_ms = frame
            .timestamp()
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        self.frames.push((timestamp_ms, jpeg));
        Ok(())
    }

    fn encode_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        let audio = self.audio.get_or_insert_with(|| PendingAudio {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            samples: Vec::new(),
        });

        if audio.sample_rate != frame.sample_rate || audio.channels != frame.channels {
            warn!(
                "Dropping {} Hz/{} ch audio in a {} Hz/{} ch segment",
                frame.sample_rate, frame.channels, audio.sample_rate, audio.channels
            );
            return Ok(());
        }

        audio.samples.extend_from_slice(&frame.samples);
        Ok(())
    }

    fn flush(&mut self) -> Result<Vec<u8>> {
        if !self.has_pending() {
            return Ok(Vec::new());
        }

        let wav = match self.audio.take() {
            Some(audio) if !audio.samples.is_empty() => Self::encode_wav(&audio)?,
            _ => Vec::new(),
        };

        let frames = std::mem::take(&mut self.frames);
        let frame_bytes: usize = frames.iter().map(|(_, jpeg)| jpeg.len() + 12).sum();
        let mut out = Vec::with_capacity(18 + frame_bytes + 4 + wav.len());

        out.extend_from_slice(SEGMENT_MAGIC);
        out.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for (timestamp_ms, jpeg) in &frames {
            out.extend_from_slice(&timestamp_ms.to_le_bytes());
            out.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
            out.extend_from_slice(jpeg);
        }
        out.extend_from_slice(&(wav.len() as u32).to_le_bytes());
        out.extend_from_slice(&wav);

        self.segments += 1;
        debug!(
            "Closed segment {} ({} frames, {} audio bytes, {} total)",
            self.segments,
            frames.len(),
            wav.len(),
            out.len()
        );
        Ok(out)
    }
}

/// Summary of one decoded segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub width: u32,
    pub height: u32,
    /// Frame timestamps in milliseconds
    pub frame_timestamps: Vec<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Interleaved samples in the WAV payload
    pub audio_samples: usize,
    /// Bytes taken by this segment
    pub len: usize,
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= n,
            "segment truncated at byte {}",
            self.pos
        );
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Decode the segment at the start of `data`, validating every JPEG frame
/// and the WAV payload
pub fn read_segment(data: &[u8]) -> Result<SegmentInfo> {
    let mut reader = ByteReader { data, pos: 0 };

    ensure!(reader.take(4)? == SEGMENT_MAGIC, "not a recording segment");
    let version = reader.u16()?;
    ensure!(version == SEGMENT_VERSION, "unsupported segment version {}", version);

    let width = reader.u32()?;
    let height = reader.u32()?;
    let frame_count = reader.u32()?;

    // Each frame needs at least its timestamp and length
    let capacity = (frame_count as usize).min(reader.remaining() / 12);
    let mut frame_timestamps = Vec::with_capacity(capacity);
    for _ in 0..frame_count {
        let timestamp_ms = reader.u64()?;
        let len = reader.u32()? as usize;
        let jpeg = reader.take(len)?;
        let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
            .context("Invalid JPEG frame in segment")?;
        ensure!(
            decoded.width() == width && decoded.height() == height,
            "frame size does not match segment header"
        );
        frame_timestamps.push(timestamp_ms);
    }

    let audio_len = reader.u32()? as usize;
    let (sample_rate, channels, audio_samples) = if audio_len > 0 {
        let wav = reader.take(audio_len)?;
        let wav = hound::WavReader::new(Cursor::new(wav)).context("Invalid WAV payload in segment")?;
        let spec = wav.spec();
        (Some(spec.sample_rate), Some(spec.channels), wav.len() as usize)
    } else {
        (None, None, 0)
    };

    Ok(SegmentInfo {
        width,
        height,
        frame_timestamps,
        sample_rate,
        channels,
        audio_samples,
        len: reader.pos,
    })
}

/// Decode every segment in a concatenated recording
pub fn read_segments(mut data: &[u8]) -> Result<Vec<SegmentInfo>> {
    let mut segments = Vec::new();
    while !data.is_empty() {
        let segment = read_segment(data).with_context(|| format!("segment {}", segments.len()))?;
        data = &data[segment.len..];
        segments.push(segment);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Origin;
    use image::{Rgba, RgbaImage};

    fn settings(width: u32, height: u32) -> EncoderSettings {
        EncoderSettings {
            mime_type: MJPEG_SEGMENT_MIME.to_string(),
            width,
            height,
            frame_rate: 30.0,
            video_bitrate: 5_000_000,
            audio_bitrate: 128_000,
        }
    }

    fn frame(width: u32, height: u32, ms: u64) -> VideoFrame {
        VideoFrame::new(
            RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255])),
            Some(Duration::from_millis(ms)),
        )
    }

    #[test]
    fn test_empty_flush_produces_nothing() {
        let mut encoder = MjpegSegmentEncoder::new(&settings(16, 16));
        assert!(encoder.flush().unwrap().is_empty());
    }

    #[test]
    fn test_segment_decodes_on_its_own() {
        let mut encoder = MjpegSegmentEncoder::new(&settings(32, 24));
        encoder.encode_video(&frame(32, 24, 0)).unwrap();
        encoder.encode_video(&frame(32, 24, 33)).unwrap();
        encoder
            .encode_audio(&AudioFrame {
                samples: vec![100; 480],
                sample_rate: 48000,
                channels: 1,
                timestamp_ms: 0,
                origin: Origin::Mixed,
            })
            .unwrap();

        let bytes = encoder.flush().unwrap();
        let info = read_segment(&bytes).unwrap();

        assert_eq!(info.width, 32);
        assert_eq!(info.frame_timestamps, vec![0, 33]);
        assert_eq!(info.sample_rate, Some(48000));
        assert_eq!(info.audio_samples, 480);
        assert_eq!(info.len, bytes.len());

        assert!(encoder.flush().unwrap().is_empty(), "flush must reset the segment");
    }

    #[test]
    fn test_oversized_frame_count_is_rejected() {
        let mut bytes = SEGMENT_MAGIC.to_vec();
        bytes.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&32u32.to_le_bytes());
        bytes.extend_from_slice(&24u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = read_segment(&bytes).unwrap_err();
        assert!(err.to_string().contains("truncated"), "got: {}", err);
    }

    #[test]
    fn test_mismatched_frame_size_is_an_error() {
        let mut encoder = MjpegSegmentEncoder::new(&settings(32, 24));
        assert!(encoder.encode_video(&frame(16, 16, 0)).is_err());
    }

    #[test]
    fn test_quality_follows_bitrate() {
        let mut low = settings(1920, 1080);
        low.video_bitrate = 100_000;
        let mut high = settings(320, 240);
        high.video_bitrate = 50_000_000;

        assert_eq!(jpeg_quality(&low), MIN_QUALITY);
        assert_eq!(jpeg_quality(&high), MAX_QUALITY);
        assert!(jpeg_quality(&settings(1280, 720)) > MIN_QUALITY);
    }

    #[test]
    fn test_host_rejects_other_types() {
        let host = SegmentEncoderHost;
        assert!(host.is_type_supported(MJPEG_SEGMENT_MIME));
        assert!(!host.is_type_supported("video/webm"));

        let mut other = settings(8, 8);
        other.mime_type = "video/webm".into();
        assert!(host.create(&other).is_err());
    }
}
