//! Engine tuning knobs.
//!
//! Priority: JSON file (`--config`) → `REELPLAY_*` environment variables → defaults.
//! Every field has a default so partial files are fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::decode::AudioFormat;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded wait of reader threads on their request queue
    pub queue_wait_ms: u64,
    /// Player tick wait while frames are in flight
    pub tick_wait_ms: u64,
    /// Player tick wait when idle
    pub idle_tick_wait_ms: u64,
    /// Decoded frames a video reader may hold ahead of the last request
    pub video_read_ahead: usize,
    /// Recently delivered frames kept per video reader
    pub recent_frame_cache: usize,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Seconds between reader diagnostics lines
    pub diagnostics_interval_secs: u64,
    /// Rate assigned to image sequences
    pub sequence_rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_wait_ms: 200,
            tick_wait_ms: 2,
            idle_tick_wait_ms: 50,
            video_read_ahead: 8,
            recent_frame_cache: 16,
            audio_sample_rate: 48000,
            audio_channels: 2,
            diagnostics_interval_secs: 10,
            sequence_rate: 24.0,
        }
    }
}

impl EngineConfig {
    /// Load from JSON, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `REELPLAY_<FIELD>` overrides from `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {key}: '{value}'"))
        }

        macro_rules! env_field {
            ($field:ident, $key:literal) => {
                if let Some(v) = lookup($key) {
                    self.$field = parse($key, v)?;
                }
            };
        }

        env_field!(queue_wait_ms, "REELPLAY_QUEUE_WAIT_MS");
        env_field!(tick_wait_ms, "REELPLAY_TICK_WAIT_MS");
        env_field!(idle_tick_wait_ms, "REELPLAY_IDLE_TICK_WAIT_MS");
        env_field!(video_read_ahead, "REELPLAY_VIDEO_READ_AHEAD");
        env_field!(recent_frame_cache, "REELPLAY_RECENT_FRAME_CACHE");
        env_field!(audio_sample_rate, "REELPLAY_AUDIO_SAMPLE_RATE");
        env_field!(audio_channels, "REELPLAY_AUDIO_CHANNELS");
        env_field!(diagnostics_interval_secs, "REELPLAY_DIAGNOSTICS_INTERVAL_SECS");
        env_field!(sequence_rate, "REELPLAY_SEQUENCE_RATE");
        Ok(self)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.queue_wait_ms == 0 || self.idle_tick_wait_ms == 0 {
            return Err(EngineError::config("wait intervals must be positive"));
        }
        if self.audio_sample_rate == 0 || self.audio_channels == 0 {
            return Err(EngineError::config("audio format needs a sample rate and channels"));
        }
        if !(self.sequence_rate > 0.0) {
            return Err(EngineError::config(format!("invalid sequence rate {}", self.sequence_rate)));
        }
        Ok(())
    }

    pub fn tick_wait(&self) -> Duration {
        Duration::from_millis(self.tick_wait_ms.max(1))
    }

    pub fn idle_tick_wait(&self) -> Duration {
        Duration::from_millis(self.idle_tick_wait_ms)
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            queue_wait: Duration::from_millis(self.queue_wait_ms),
            video_read_ahead: self.video_read_ahead,
            recent_frame_cache: self.recent_frame_cache,
            audio: AudioFormat {
                sample_rate: self.audio_sample_rate,
                channels: self.audio_channels,
            },
            diagnostics_interval: Duration::from_secs(self.diagnostics_interval_secs),
        }
    }
}

/// Per-reader settings derived from `EngineConfig`
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub queue_wait: Duration,
    pub video_read_ahead: usize,
    pub recent_frame_cache: usize,
    pub audio: AudioFormat,
    pub diagnostics_interval: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        EngineConfig::default().reader_options()
    }
}
