// Software compositor
//
// Redraws on every tick of the render clock using the newest frame seen
// from each input. Inputs are drained without waiting and their buffers go
// back to the producers right away; the pixels are kept on this side.
// The loop runs until the output track is released, whatever the encoder
// is doing, so it also serves as a live preview.

use image::RgbaImage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::canvas::Surface;
use super::CompositorConfig;
use crate::media::{Track, TrackSink, VideoFrame};

pub(crate) struct SoftwareCompositor {
    task: JoinHandle<()>,
}

impl SoftwareCompositor {
    pub fn spawn(
        primary: Track,
        secondary: Track,
        sink: TrackSink<VideoFrame>,
        config: CompositorConfig,
    ) -> Self {
        Self {
            task: tokio::spawn(render_loop(primary, secondary, sink, config)),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct LatestInput {
    image: Option<RgbaImage>,
    timestamp: Option<Duration>,
    ended: bool,
}

impl LatestInput {
    fn update(&mut self, (frame, ended): (Option<VideoFrame>, bool)) {
        if let Some(frame) = frame {
            self.timestamp = frame.timestamp();
            self.image = Some(frame.into_image());
        }
        self.ended |= ended;
    }
}

async fn render_loop(
    primary: Track,
    secondary: Track,
    sink: TrackSink<VideoFrame>,
    config: CompositorConfig,
) {
    let (Some(mut primary_reader), Some(mut secondary_reader)) =
        (primary.video_reader().await, secondary.video_reader().await)
    else {
        return;
    };
    let Some(pool) = sink.pool().cloned() else {
        return;
    };

    let mut surface = Surface::new(config.width, config.height);
    let mut clock = tokio::time::interval(config.frame_interval());
    clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    let mut primary_input = LatestInput::default();
    let mut secondary_input = LatestInput::default();
    let mut drawn: u64 = 0;
    let mut dropped: u64 = 0;

    info!(
        "Software compositor running ({}x{} @ {}fps)",
        config.width, config.height, config.frame_rate
    );

    loop {
        tokio::select! {
            _ = sink.stopped() => break,
            _ = clock.tick() => {}
        }

        primary_input.update(primary_reader.latest());
        secondary_input.update(secondary_reader.latest());
        if primary_input.ended && secondary_input.ended {
            debug!("Both compositor inputs ended");
            break;
        }

        let canvas = surface.draw(primary_input.image.as_ref(), secondary_input.image.as_ref());
        drawn += 1;

        // Never wait on the consumer: a frame it has no room for is dropped
        let Some(slot) = pool.try_acquire() else {
            dropped += 1;
            continue;
        };
        let timestamp = primary_input.timestamp.unwrap_or_else(|| started.elapsed());
        if !sink.try_send(VideoFrame::pooled(canvas.clone(), Some(timestamp), slot)) {
            dropped += 1;
        }
    }

    info!(
        "Software compositor stopped ({} frames drawn, {} dropped)",
        drawn, dropped
    );
}
