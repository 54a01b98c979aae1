//! Decoder adapters: the uniform contract readers decode through.
//!
//! **Why**: a `Reader` only knows "seek to unit n, give me the next unit".
//! Each codec family (still images and numbered sequences, FFmpeg containers)
//! implements that contract once and converts its native layout into the
//! canonical `Image` / interleaved f32 samples.
//!
//! **Used by**: `core::reader` (decode threads), `core::reader_pool` (probe)
//!
//! # Contract
//!
//! - `probe` is synchronous and cheap enough to run on the player tick.
//! - After `seek(n)` the next `decode_next` yields unit `n`, then `n+1`, ...
//! - `Ok(None)` is end of stream; `Err` is a decode failure for that unit.
//! - Decoders are created on, and only used from, the reader's own thread.

pub mod image_seq;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::entities::{Image, PixelFormat};
use crate::error::{EngineError, EngineResult};
use crate::time::TimeRange;

/// Video stream description
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    /// Native frame rate
    pub rate: f64,
    /// First frame number and frame count at `rate`
    pub range: TimeRange,
    /// Single image: every frame number decodes to it
    pub still: bool,
}

impl VideoInfo {
    /// Whether frame `frame` can be decoded at all
    pub fn has_frame(&self, frame: i64) -> bool {
        self.still || self.range.contains(crate::time::RationalTime::new(frame as f64, self.rate))
    }
}

/// Audio stream description (native, before resampling)
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Length in samples at `sample_rate`
    pub samples: i64,
}

/// Output layout requested from audio decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Result of probing one media file
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

pub trait VideoDecoder: Send {
    /// Position so the next `decode_next` yields frame `frame`
    fn seek(&mut self, frame: i64) -> EngineResult<()>;
    fn decode_next(&mut self) -> EngineResult<Option<Image>>;
}

pub trait AudioDecoder: Send {
    /// Position at `sample` (output sample rate)
    fn seek(&mut self, sample: i64) -> EngineResult<()>;
    /// Next chunk of interleaved samples in the requested `AudioFormat`
    fn decode_next(&mut self) -> EngineResult<Option<Vec<f32>>>;
}

/// One codec family
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, path: &Path) -> bool;
    fn probe(&self, path: &Path) -> EngineResult<MediaInfo>;
    fn open_video(&self, info: &MediaInfo) -> EngineResult<Box<dyn VideoDecoder>>;
    fn open_audio(&self, info: &MediaInfo, format: AudioFormat) -> EngineResult<Box<dyn AudioDecoder>>;
}

/// Dispatches to the first backend that accepts a path
#[derive(Default)]
pub struct DecoderRegistry {
    backends: Vec<Arc<dyn DecoderBackend>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image sequences always; FFmpeg when built with the `ffmpeg` feature
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "ffmpeg")]
        registry.register(Arc::new(ffmpeg::FfmpegBackend::new()));
        registry.register(Arc::new(image_seq::ImageSeqBackend::new(config.sequence_rate)));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn DecoderBackend>) {
        log::debug!("Registered decoder backend '{}'", backend.name());
        self.backends.push(backend);
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    fn backend_for(&self, path: &Path) -> EngineResult<&Arc<dyn DecoderBackend>> {
        self.backends
            .iter()
            .find(|b| b.supports(path))
            .ok_or_else(|| EngineError::Unsupported(path.display().to_string()))
    }
}

impl DecoderBackend for DecoderRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    fn supports(&self, path: &Path) -> bool {
        self.backends.iter().any(|b| b.supports(path))
    }

    fn probe(&self, path: &Path) -> EngineResult<MediaInfo> {
        self.backend_for(path)?.probe(path)
    }

    fn open_video(&self, info: &MediaInfo) -> EngineResult<Box<dyn VideoDecoder>> {
        self.backend_for(&info.path)?.open_video(info)
    }

    fn open_audio(&self, info: &MediaInfo, format: AudioFormat) -> EngineResult<Box<dyn AudioDecoder>> {
        self.backend_for(&info.path)?.open_audio(info, format)
    }
}

/// Lowercased file extension, empty when missing
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase()
}
