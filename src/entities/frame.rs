//! Decoded units and composited frame descriptions
//!
//! **Why**: Readers hand decoded pixels/samples back through tickets, and the
//! player assembles them into a `Frame` that the renderer composites. Nothing
//! here touches a graphics API.
//!
//! # Pixel Formats
//!
//! - `PixelBuffer::U8`: LDR sources (8-bit video, PNG/JPEG), 4 bytes/pixel
//! - `PixelBuffer::F16`: high bit-depth video, 8 bytes/pixel
//! - `PixelBuffer::F32`: HDR stills (EXR/HDR), 16 bytes/pixel
//!
//! Images are immutable once decoded and shared via `Arc`, so a frame that
//! is both in a reader's recent cache and in a delivered `Frame` costs one buffer.

use half::f16 as F16;
use std::sync::Arc;

use super::transition::TransitionKind;
use crate::time::{RationalTime, TimeRange};

/// Pixel buffer storage, always RGBA interleaved
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    F16(Vec<F16>),
    F32(Vec<f32>),
}

/// Canonical pixel layouts produced by decoder adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    RgbaF16,
    RgbaF32,
}

impl PixelBuffer {
    pub fn format(&self) -> PixelFormat {
        match self {
            PixelBuffer::U8(_) => PixelFormat::Rgba8,
            PixelBuffer::F16(_) => PixelFormat::RgbaF16,
            PixelBuffer::F32(_) => PixelFormat::RgbaF32,
        }
    }

    /// Number of channel values (not pixels)
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::F16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::F16(v) => v.len() * 2,
            PixelBuffer::F32(v) => v.len() * 4,
        }
    }
}

/// Decoded RGBA image in the engine's canonical layout (tightly packed rows)
#[derive(Debug, Clone)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub buffer: PixelBuffer,
}

impl Image {
    /// Build an image, rejecting buffers whose size does not match the dimensions
    pub fn new(width: usize, height: usize, buffer: PixelBuffer) -> Option<Self> {
        if buffer.len() != width * height * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            buffer,
        })
    }

    /// Solid RGBA8 image
    pub fn filled(width: usize, height: usize, rgba: [u8; 4]) -> Self {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_mut(4) {
            px.copy_from_slice(&rgba);
        }
        Self {
            width,
            height,
            buffer: PixelBuffer::U8(data),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn mem(&self) -> usize {
        self.buffer.mem()
    }

    /// First pixel as RGBA8, used by diagnostics and tests
    pub fn first_pixel_u8(&self) -> Option<[u8; 4]> {
        match &self.buffer {
            PixelBuffer::U8(v) if v.len() >= 4 => Some([v[0], v[1], v[2], v[3]]),
            PixelBuffer::F16(v) if v.len() >= 4 => {
                let c = |x: F16| (x.to_f32().clamp(0.0, 1.0) * 255.0) as u8;
                Some([c(v[0]), c(v[1]), c(v[2]), c(v[3])])
            }
            PixelBuffer::F32(v) if v.len() >= 4 => {
                let c = |x: f32| (x.clamp(0.0, 1.0) * 255.0) as u8;
                Some([c(v[0]), c(v[1]), c(v[2]), c(v[3])])
            }
            _ => None,
        }
    }
}

/// One decoded video unit, keyed by its time in the source media
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub time: RationalTime,
    pub image: Arc<Image>,
}

/// Decoded audio span: interleaved f32 samples at `sample_rate`
#[derive(Debug, Clone)]
pub struct AudioUnit {
    pub range: TimeRange,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioUnit {
    /// Number of sample frames (samples per channel)
    pub fn sample_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// One track's contribution to a composited frame.
///
/// During a transition `image_b` carries the neighbouring clip and
/// `transition_value` is the weight of `image_b`, always in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct FrameLayer {
    pub image: Option<Arc<Image>>,
    pub image_b: Option<Arc<Image>>,
    pub transition: TransitionKind,
    pub transition_value: f32,
}

impl FrameLayer {
    pub fn has_image(&self) -> bool {
        self.image.is_some() || self.image_b.is_some()
    }
}

/// Orchestrator output for one requested timeline time.
///
/// Layers are ordered bottom (first video track) to top. Zero layers is a valid
/// result: nothing on the timeline covers `time`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub time: RationalTime,
    pub layers: Vec<FrameLayer>,
}

impl Frame {
    pub fn empty(time: RationalTime) -> Self {
        Self {
            time,
            layers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn mem(&self) -> usize {
        self.layers
            .iter()
            .map(|l| {
                l.image.as_ref().map_or(0, |i| i.mem()) + l.image_b.as_ref().map_or(0, |i| i.mem())
            })
            .sum()
    }
}

/// One audio track's contribution to an audio request
#[derive(Debug, Clone)]
pub struct AudioLayer {
    pub audio: AudioUnit,
}

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub range: TimeRange,
    pub layers: Vec<AudioLayer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: Image::new rejects mismatched buffers
    /// Validates: canonical layout is 4 values per pixel
    #[test]
    fn test_image_size_check() {
        assert!(Image::new(2, 2, PixelBuffer::U8(vec![0; 16])).is_some());
        assert!(Image::new(2, 2, PixelBuffer::U8(vec![0; 12])).is_none());
        assert!(Image::new(1, 1, PixelBuffer::F32(vec![0.0; 4])).is_some());
    }

    /// Test: PixelBuffer memory accounting
    #[test]
    fn test_pixel_buffer_mem() {
        assert_eq!(PixelBuffer::U8(vec![0; 16]).mem(), 16);
        assert_eq!(PixelBuffer::F16(vec![F16::ZERO; 16]).mem(), 32);
        assert_eq!(PixelBuffer::F32(vec![0.0; 16]).mem(), 64);
    }

    #[test]
    fn test_first_pixel_normalizes_float() {
        let img = Image::new(1, 1, PixelBuffer::F32(vec![1.0, 0.5, 0.0, 2.0])).unwrap();
        assert_eq!(img.first_pixel_u8(), Some([255, 127, 0, 255]));
        let img = Image::filled(3, 2, [10, 20, 30, 255]);
        assert_eq!(img.first_pixel_u8(), Some([10, 20, 30, 255]));
        assert_eq!(img.format(), PixelFormat::Rgba8);
    }

    #[test]
    fn test_frame_mem_counts_both_images() {
        let img = Arc::new(Image::filled(2, 2, [0, 0, 0, 255]));
        let frame = Frame {
            time: RationalTime::new(0.0, 24.0),
            layers: vec![FrameLayer {
                image: Some(img.clone()),
                image_b: Some(img),
                transition: TransitionKind::Dissolve,
                transition_value: 0.5,
            }],
        };
        assert_eq!(frame.mem(), 32);
        assert!(!frame.is_empty());
    }
}
