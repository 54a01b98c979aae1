//! Scripted decoder backend for tests.
//!
//! Produces deterministic 2x2 frames whose first pixel encodes the frame
//! number (R + G * 256) and a per-file tag (B), and audio whose sample values
//! are the sample index. Counts probes/opens/seeks and can inject failures,
//! delays and panics per path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{extension_of, AudioDecoder, AudioFormat, AudioInfo, DecoderBackend, MediaInfo, VideoDecoder, VideoInfo};
use crate::entities::{Image, PixelFormat};
use crate::error::{EngineError, EngineResult};
use crate::time::TimeRange;

const AUDIO_CHUNK: i64 = 1024;

/// Behaviour of one scripted media file
#[derive(Debug, Clone)]
pub struct MediaScript {
    pub frames: i64,
    pub rate: f64,
    /// Audio length in output samples; `None` = no audio stream
    pub audio_samples: Option<i64>,
    pub fail_probe: bool,
    pub fail_open: bool,
    pub decode_delay: Duration,
    pub panic_at: Option<i64>,
}

impl Default for MediaScript {
    fn default() -> Self {
        Self {
            frames: 100,
            rate: 24.0,
            audio_samples: None,
            fail_probe: false,
            fail_open: false,
            decode_delay: Duration::ZERO,
            panic_at: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptStats {
    pub probes: AtomicUsize,
    pub video_opens: AtomicUsize,
    pub audio_opens: AtomicUsize,
    pub seeks: AtomicUsize,
    pub decoded: AtomicUsize,
}

impl ScriptStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    scripts: Mutex<HashMap<PathBuf, MediaScript>>,
    default: MediaScript,
    stats: Arc<ScriptStats>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: MediaScript::default(),
            stats: Arc::new(ScriptStats::default()),
        }
    }

    pub fn with_media(self, path: impl Into<PathBuf>, script: MediaScript) -> Self {
        self.scripts.lock().insert(path.into(), script);
        self
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        Arc::clone(&self.stats)
    }

    fn script(&self, path: &Path) -> MediaScript {
        self.scripts.lock().get(path).cloned().unwrap_or_else(|| self.default.clone())
    }
}

/// Per-file marker stored in the blue channel
pub fn tag_of(path: &Path) -> u8 {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    (name.bytes().map(u32::from).sum::<u32>() % 251) as u8
}

/// Frame number encoded in a scripted image
pub fn frame_of(image: &Image) -> i64 {
    image.first_pixel_u8().map_or(-1, |px| px[0] as i64 + px[1] as i64 * 256)
}

pub fn scripted_image(frame: i64, tag: u8) -> Image {
    Image::filled(2, 2, [(frame % 256) as u8, ((frame / 256) % 256) as u8, tag, 255])
}

impl DecoderBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, path: &Path) -> bool {
        matches!(extension_of(path).as_str(), "mov" | "mp4" | "mxf" | "wav")
    }

    fn probe(&self, path: &Path) -> EngineResult<MediaInfo> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        let script = self.script(path);
        if script.fail_probe {
            return Err(EngineError::probe(path, "scripted probe failure"));
        }
        Ok(MediaInfo {
            path: path.to_path_buf(),
            video: (script.frames > 0).then(|| VideoInfo {
                width: 2,
                height: 2,
                format: PixelFormat::Rgba8,
                rate: script.rate,
                range: TimeRange::from_units(0.0, script.frames as f64, script.rate),
                still: false,
            }),
            audio: script.audio_samples.map(|samples| AudioInfo {
                sample_rate: 48000,
                channels: 2,
                samples,
            }),
        })
    }

    fn open_video(&self, info: &MediaInfo) -> EngineResult<Box<dyn VideoDecoder>> {
        self.stats.video_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.script(&info.path);
        if script.fail_open {
            return Err(EngineError::open(&info.path, "scripted open failure"));
        }
        Ok(Box::new(ScriptedVideo {
            tag: tag_of(&info.path),
            next: 0,
            script,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn open_audio(&self, info: &MediaInfo, format: AudioFormat) -> EngineResult<Box<dyn AudioDecoder>> {
        self.stats.audio_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.script(&info.path);
        if script.fail_open {
            return Err(EngineError::open(&info.path, "scripted open failure"));
        }
        Ok(Box::new(ScriptedAudio {
            total: script.audio_samples.unwrap_or(0),
            channels: format.channels as usize,
            next: 0,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedVideo {
    script: MediaScript,
    tag: u8,
    next: i64,
    stats: Arc<ScriptStats>,
}

impl VideoDecoder for ScriptedVideo {
    fn seek(&mut self, frame: i64) -> EngineResult<()> {
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        self.next = frame;
        Ok(())
    }

    fn decode_next(&mut self) -> EngineResult<Option<Image>> {
        if self.next < 0 || self.next >= self.script.frames {
            return Ok(None);
        }
        if !self.script.decode_delay.is_zero() {
            std::thread::sleep(self.script.decode_delay);
        }
        if self.script.panic_at == Some(self.next) {
            panic!("scripted decoder panic at frame {}", self.next);
        }
        let image = scripted_image(self.next, self.tag);
        self.next += 1;
        self.stats.decoded.fetch_add(1, Ordering::SeqCst);
        Ok(Some(image))
    }
}

struct ScriptedAudio {
    total: i64,
    channels: usize,
    next: i64,
    stats: Arc<ScriptStats>,
}

impl AudioDecoder for ScriptedAudio {
    fn seek(&mut self, sample: i64) -> EngineResult<()> {
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        self.next = sample.max(0);
        Ok(())
    }

    fn decode_next(&mut self) -> EngineResult<Option<Vec<f32>>> {
        let count = AUDIO_CHUNK.min(self.total - self.next);
        if count <= 0 {
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(count as usize * self.channels);
        for i in self.next..self.next + count {
            samples.extend(std::iter::repeat_n(i as f32, self.channels));
        }
        self.next += count;
        Ok(Some(samples))
    }
}
