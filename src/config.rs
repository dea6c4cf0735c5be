//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ClipError, Result};
use crate::types::AudioCodec;

/// Timing configuration shared by the demux and remux sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Quiet window before a metadata refresh is reported, in milliseconds
    pub ready_debounce_ms: u64,

    /// Window both decode queues must stay empty before completion, in milliseconds
    pub settle_window_ms: u64,

    /// Encoder queue poll interval for progress, in milliseconds
    pub progress_interval_ms: u64,

    /// Default progressive output interval, in milliseconds
    pub time_slice_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ready_debounce_ms: 300,
            settle_window_ms: 300,
            progress_interval_ms: 100,
            time_slice_ms: 500,
        }
    }
}

impl PipelineConfig {
    pub fn ready_debounce(&self) -> Duration {
        Duration::from_millis(self.ready_debounce_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| ClipError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ClipError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Output video parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoEncodeConfig {
    pub width: u32,
    pub height: u32,
    /// Expected frame rate handed to the encoder
    pub expect_fps: f64,
}

impl Default for VideoEncodeConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            expect_fps: 30.0,
        }
    }
}

/// Output audio parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioEncodeConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    /// Bits per sample recorded in the sample entry
    pub sample_size: u16,
    pub channel_count: u16,
}

impl Default for AudioEncodeConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            sample_rate: 48000,
            sample_size: 16,
            channel_count: 2,
        }
    }
}

/// Per-session encode/remux options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxOptions {
    pub video: VideoEncodeConfig,
    pub audio: AudioEncodeConfig,
    /// Video bitrate in bps
    pub bitrate: u32,
}

impl Default for RemuxOptions {
    fn default() -> Self {
        Self {
            video: VideoEncodeConfig::default(),
            audio: AudioEncodeConfig::default(),
            bitrate: 5_000_000,
        }
    }
}
