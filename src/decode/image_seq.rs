//! Still images and numbered image sequences.
//!
//! A clip path such as `/plates/shot.0101.exr` (or `shot.####.exr`) is
//! expanded with `glob` into every sibling frame sharing the prefix and
//! extension. Frame numbers are the numbers in the filenames, so source ranges
//! in a timeline address plates the way artists do (`1001..`).
//!
//! A single file with no frame number is a still: every frame decodes to the
//! same image.
//!
//! Pixel conversion follows the image's own depth:
//! - 8-bit → `PixelBuffer::U8`
//! - 16-bit → `PixelBuffer::F16` (normalized)
//! - float (EXR/HDR) → `PixelBuffer::F32`

use half::f16 as F16;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{extension_of, AudioDecoder, AudioFormat, DecoderBackend, MediaInfo, VideoDecoder, VideoInfo};
use crate::entities::{Image, PixelBuffer, PixelFormat};
use crate::error::{EngineError, EngineResult};
use crate::time::TimeRange;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "tga", "exr", "hdr"];

pub struct ImageSeqBackend {
    rate: f64,
}

impl ImageSeqBackend {
    /// `rate` is the playback rate assigned to sequences (they carry none)
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }
}

impl DecoderBackend for ImageSeqBackend {
    fn name(&self) -> &str {
        "image-seq"
    }

    fn supports(&self, path: &Path) -> bool {
        EXTENSIONS.contains(&extension_of(path).as_str())
    }

    fn probe(&self, path: &Path) -> EngineResult<MediaInfo> {
        let frames = scan_frames(path)?;
        let first = frames
            .values()
            .next()
            .ok_or_else(|| EngineError::probe(path, "no frames found"))?;
        let (width, height) = header(first)?;

        let (start, end) = match (frames.keys().next(), frames.keys().next_back()) {
            (Some(&s), Some(&e)) => (s, e),
            _ => (0, 0),
        };
        let still = is_still(path, &frames);
        debug!(
            "Probed {}: {}x{}, frames {}..={}{}",
            path.display(),
            width,
            height,
            start,
            end,
            if still { " (still)" } else { "" }
        );

        Ok(MediaInfo {
            path: path.to_path_buf(),
            video: Some(VideoInfo {
                width,
                height,
                format: format_for(path),
                rate: self.rate,
                range: TimeRange::from_units(start as f64, (end - start + 1) as f64, self.rate),
                still,
            }),
            audio: None,
        })
    }

    fn open_video(&self, info: &MediaInfo) -> EngineResult<Box<dyn VideoDecoder>> {
        let frames = scan_frames(&info.path)?;
        let still = is_still(&info.path, &frames);
        Ok(Box::new(SequenceDecoder::new(Arc::new(frames), still)))
    }

    fn open_audio(&self, info: &MediaInfo, _format: AudioFormat) -> EngineResult<Box<dyn AudioDecoder>> {
        Err(EngineError::open(&info.path, "image files carry no audio"))
    }
}

/// Decodes frames of a scanned sequence; gaps hold the previous frame
struct SequenceDecoder {
    frames: Arc<BTreeMap<i64, PathBuf>>,
    still: bool,
    next: i64,
}

impl SequenceDecoder {
    fn new(frames: Arc<BTreeMap<i64, PathBuf>>, still: bool) -> Self {
        let next = frames.keys().next().copied().unwrap_or(0);
        Self { frames, still, next }
    }
}

impl VideoDecoder for SequenceDecoder {
    fn seek(&mut self, frame: i64) -> EngineResult<()> {
        self.next = frame;
        Ok(())
    }

    fn decode_next(&mut self) -> EngineResult<Option<Image>> {
        let path = if self.still {
            self.frames.values().next()
        } else {
            let last = self.frames.keys().next_back().copied().unwrap_or(-1);
            if self.next > last {
                return Ok(None);
            }
            self.frames
                .range(..=self.next)
                .next_back()
                .or_else(|| self.frames.iter().next())
                .map(|(_, p)| p)
        };
        let Some(path) = path else {
            return Ok(None);
        };
        trace!("Decoding frame {} from {}", self.next, path.display());
        let image = load(path)?;
        self.next += 1;
        Ok(Some(image))
    }
}

/// Read dimensions without decoding pixels
pub fn header(path: &Path) -> EngineResult<(usize, usize)> {
    let reader = image::ImageReader::open(path).map_err(|e| EngineError::open(path, e.to_string()))?;
    let (w, h) = reader
        .into_dimensions()
        .map_err(|e| EngineError::probe(path, e.to_string()))?;
    Ok((w as usize, h as usize))
}

/// Decode one file into the canonical RGBA layout
pub fn load(path: &Path) -> EngineResult<Image> {
    use image::DynamicImage;

    let img = image::open(path).map_err(|e| EngineError::decode(format!("{}: {}", path.display(), e)))?;
    let width = img.width() as usize;
    let height = img.height() as usize;

    let buffer = match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) | DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_) => {
            PixelBuffer::U8(img.to_rgba8().into_raw())
        }
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) | DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => {
            let data = img.to_rgba16().into_raw();
            PixelBuffer::F16(data.iter().map(|&v| F16::from_f32(v as f32 / 65535.0)).collect())
        }
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => PixelBuffer::F32(img.to_rgba32f().into_raw()),
        _ => PixelBuffer::U8(img.to_rgba8().into_raw()),
    };

    Image::new(width, height, buffer)
        .ok_or_else(|| EngineError::decode(format!("{}: unexpected buffer size", path.display())))
}

fn format_for(path: &Path) -> PixelFormat {
    match extension_of(path).as_str() {
        "exr" | "hdr" => PixelFormat::RgbaF32,
        _ => PixelFormat::Rgba8,
    }
}

/// Still unless the path names a frame and siblings were found
fn is_still(path: &Path, frames: &BTreeMap<i64, PathBuf>) -> bool {
    frames.len() == 1 && split_sequence_path(path).is_none() && !has_hash_padding(path)
}

fn has_hash_padding(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.ends_with('#'))
}

/// Split a sequence filename into (prefix, number, ext, padding)
///
/// Example: "/path/seq.0001.exr" -> ("/path/seq.", 1, "exr", 4)
pub fn split_sequence_path(path: &Path) -> Option<(String, i64, String, usize)> {
    let ext = path.extension()?.to_str()?.to_string();
    let stem = path.file_stem()?.to_str()?;

    let digit_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;

    let number_str = &stem[digit_start..];
    let number = number_str.parse::<i64>().ok()?;
    Some((prefix_with_parent(path, &stem[..digit_start]), number, ext, number_str.len()))
}

fn prefix_with_parent(path: &Path, local: &str) -> String {
    let mut prefix = String::new();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        prefix.push_str(&parent.to_string_lossy());
        if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
            prefix.push(std::path::MAIN_SEPARATOR);
        }
    }
    prefix.push_str(local);
    prefix
}

/// Every frame of the sequence `path` belongs to, keyed by frame number
fn scan_frames(path: &Path) -> EngineResult<BTreeMap<i64, PathBuf>> {
    let (prefix, ext) = if let Some((prefix, _, ext, _)) = split_sequence_path(path) {
        (prefix, ext)
    } else if has_hash_padding(path) {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let local = stem.trim_end_matches('#');
        (prefix_with_parent(path, local), extension_of(path))
    } else {
        if !path.is_file() {
            return Err(EngineError::open(path, "file not found"));
        }
        return Ok(BTreeMap::from([(0, path.to_path_buf())]));
    };

    let pattern = format!("{}*.{}", glob::Pattern::escape(&prefix), glob::Pattern::escape(&ext));
    let entries = glob::glob(&pattern).map_err(|e| EngineError::open(path, format!("glob error for {pattern}: {e}")))?;

    let mut frames = BTreeMap::new();
    for entry in entries {
        let candidate = entry.map_err(|e| EngineError::open(path, format!("glob entry error: {e}")))?;
        // Same prefix and extension, digits only in between
        if let Some((p, number, e, _)) = split_sequence_path(&candidate) {
            if p == prefix && e == ext {
                frames.insert(number, candidate);
            }
        }
    }

    if frames.is_empty() {
        return Err(EngineError::open(path, "no sequence frames on disk"));
    }
    Ok(frames)
}
