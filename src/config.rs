use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::compositor::DEFAULT_READY_TIMEOUT;
use crate::encoder::{PipelineConfig, DEFAULT_CODEC_PREFERENCES, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_CHUNKS};

/// Prefix of environment overrides, e.g. `DUAL_RECORDER_PIPELINE__MAX_CHUNKS=200`
pub const ENV_PREFIX: &str = "DUAL_RECORDER";

/// Recorder tuning shared by every session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub compositor: CompositorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Chunks kept before the oldest is evicted
    pub max_chunks: usize,
    pub flush_interval_ms: u64,
    /// Container/codec identifiers in order of preference
    pub codec_preferences: Vec<String>,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            codec_preferences: DEFAULT_CODEC_PREFERENCES.iter().map(|s| s.to_string()).collect(),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorSettings {
    /// Try the accelerated compositor when a device is available
    pub accelerated: bool,
    pub accelerated_ready_timeout_ms: u64,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            accelerated: true,
            accelerated_ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Defaults, then `path` if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pipeline.codec_preferences")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read recorder settings")?;

        let settings: Settings = settings
            .try_deserialize()
            .context("Invalid recorder settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_chunks == 0 {
            bail!("pipeline.max_chunks must be at least 1");
        }
        if self.pipeline.flush_interval_ms == 0 {
            bail!("pipeline.flush_interval_ms must be positive");
        }
        if self.pipeline.codec_preferences.is_empty() {
            bail!("pipeline.codec_preferences must name at least one format");
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.flush_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.compositor.accelerated_ready_timeout_ms)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            flush_interval: self.flush_interval(),
            max_chunks: self.pipeline.max_chunks,
        }
    }
}
