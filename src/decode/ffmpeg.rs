//! FFmpeg backend - movie containers and audio files via libav
//!
//! Video: keyframe seek (`AVSEEK_FLAG_BACKWARD`), then decode and discard
//! until the target pts. Frames are converted to RGBA8 with swscale.
//!
//! Audio: container seek in `AV_TIME_BASE`, decoder flush, then samples
//! before the target are trimmed after swresample converts to packed f32
//! at the requested rate/channel count.

use log::{debug, trace, warn};
use playa_ffmpeg as ffmpeg;
use std::path::Path;
use std::sync::Once;

use super::{extension_of, AudioDecoder, AudioFormat, AudioInfo, DecoderBackend, MediaInfo, VideoDecoder, VideoInfo};
use crate::entities::{Image, PixelBuffer, PixelFormat};
use crate::error::{EngineError, EngineResult};
use crate::time::TimeRange;

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg init failed: {}", e);
        }
        unsafe {
            // AV_LOG_QUIET: decoders report through our own log lines
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

const EXTENSIONS: &[&str] = &[
    "mov", "mp4", "m4v", "mkv", "webm", "avi", "mxf", "mpg", "mpeg", "ts", "wav", "aif", "aiff", "mp3", "flac",
    "ogg", "m4a",
];

pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        init_ffmpeg();
        Self
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn open_input(path: &Path) -> EngineResult<ffmpeg::format::context::Input> {
    ffmpeg::format::input(path).map_err(|e| EngineError::open(path, e.to_string()))
}

fn seconds_per_tick(tb: ffmpeg::Rational) -> f64 {
    if tb.denominator() == 0 {
        0.0
    } else {
        tb.numerator() as f64 / tb.denominator() as f64
    }
}

fn frame_rate(stream: &ffmpeg::format::stream::Stream) -> Option<f64> {
    [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .find(|r| r.numerator() > 0 && r.denominator() > 0)
        .map(|r| r.numerator() as f64 / r.denominator() as f64)
}

fn stream_start(stream: &ffmpeg::format::stream::Stream) -> i64 {
    let start = stream.start_time();
    if start == ffmpeg::ffi::AV_NOPTS_VALUE { 0 } else { start }
}

/// Stream duration in seconds, falling back to the container's
fn duration_secs(ictx: &ffmpeg::format::context::Input, stream: &ffmpeg::format::stream::Stream) -> f64 {
    let duration = stream.duration();
    if duration > 0 {
        return duration as f64 * seconds_per_tick(stream.time_base());
    }
    if ictx.duration() > 0 {
        return ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
    }
    0.0
}

fn decoder_context(
    path: &Path,
    stream: &ffmpeg::format::stream::Stream,
) -> EngineResult<ffmpeg::codec::context::Context> {
    ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| EngineError::open(path, format!("decoder context: {}", e)))
}

impl DecoderBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supports(&self, path: &Path) -> bool {
        EXTENSIONS.contains(&extension_of(path).as_str())
    }

    fn probe(&self, path: &Path) -> EngineResult<MediaInfo> {
        let ictx = open_input(path)?;

        let video = match ictx.streams().best(ffmpeg::media::Type::Video) {
            Some(stream) => {
                let rate = frame_rate(&stream).ok_or_else(|| EngineError::probe(path, "video stream has no frame rate"))?;
                let frames = if stream.frames() > 0 {
                    stream.frames()
                } else {
                    (duration_secs(&ictx, &stream) * rate).round() as i64
                };
                let decoder = decoder_context(path, &stream)?
                    .decoder()
                    .video()
                    .map_err(|e| EngineError::probe(path, format!("video decoder: {}", e)))?;
                Some(VideoInfo {
                    width: decoder.width() as usize,
                    height: decoder.height() as usize,
                    format: PixelFormat::Rgba8,
                    rate,
                    range: TimeRange::from_units(0.0, frames.max(1) as f64, rate),
                    still: false,
                })
            }
            None => None,
        };

        let audio = match ictx.streams().best(ffmpeg::media::Type::Audio) {
            Some(stream) => {
                let decoder = decoder_context(path, &stream)?
                    .decoder()
                    .audio()
                    .map_err(|e| EngineError::probe(path, format!("audio decoder: {}", e)))?;
                Some(AudioInfo {
                    sample_rate: decoder.rate(),
                    channels: decoder.channels() as u16,
                    samples: (duration_secs(&ictx, &stream) * decoder.rate() as f64).round() as i64,
                })
            }
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(EngineError::probe(path, "no audio or video stream"));
        }
        debug!(
            "Probed {}: video {:?}, audio {:?}",
            path.display(),
            video.as_ref().map(|v| (v.width, v.height, v.rate, v.range.duration.value)),
            audio.as_ref().map(|a| (a.sample_rate, a.channels))
        );
        Ok(MediaInfo {
            path: path.to_path_buf(),
            video,
            audio,
        })
    }

    fn open_video(&self, info: &MediaInfo) -> EngineResult<Box<dyn VideoDecoder>> {
        let path = info.path.as_path();
        let video = info.video.as_ref().ok_or_else(|| EngineError::open(path, "no video stream"))?;
        let input = open_input(path)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| EngineError::open(path, "no video stream"))?;
        let stream_index = stream.index();
        let tick = seconds_per_tick(stream.time_base());
        let start_pts = stream_start(&stream);

        let mut context = decoder_context(path, &stream)?;
        // Frame-threaded decoding, thread count auto-detected
        unsafe {
            (*context.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*context.as_mut_ptr()).thread_count = 0;
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| EngineError::open(path, format!("video decoder: {}", e)))?;

        Ok(Box::new(FfmpegVideo {
            input,
            stream_index,
            decoder,
            scaler: None,
            tick,
            rate: video.rate,
            start_pts,
            target_pts: None,
            eof_sent: false,
        }))
    }

    fn open_audio(&self, info: &MediaInfo, format: AudioFormat) -> EngineResult<Box<dyn AudioDecoder>> {
        let path = info.path.as_path();
        let input = open_input(path)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| EngineError::open(path, "no audio stream"))?;
        let stream_index = stream.index();
        let tick = seconds_per_tick(stream.time_base());
        let start_pts = stream_start(&stream);
        let decoder = decoder_context(path, &stream)?
            .decoder()
            .audio()
            .map_err(|e| EngineError::open(path, format!("audio decoder: {}", e)))?;

        Ok(Box::new(FfmpegAudio {
            input,
            stream_index,
            decoder,
            resampler: None,
            format,
            tick,
            start_pts,
            skip_to: None,
            eof_sent: false,
        }))
    }
}

/// Push the next packet of `stream_index` into `decoder`; false once the input is exhausted
fn feed(
    input: &mut ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: &mut ffmpeg::decoder::Opened,
) -> EngineResult<bool> {
    for (stream, packet) in input.packets() {
        if stream.index() == stream_index {
            decoder
                .send_packet(&packet)
                .map_err(|e| EngineError::decode(format!("send packet: {}", e)))?;
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

struct FfmpegVideo {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    /// Seconds per stream tick
    tick: f64,
    rate: f64,
    start_pts: i64,
    /// Frames before this pts are discarded after a seek
    target_pts: Option<i64>,
    eof_sent: bool,
}

impl FfmpegVideo {
    fn frame_to_pts(&self, frame: i64) -> i64 {
        if self.tick <= 0.0 {
            return self.start_pts;
        }
        self.start_pts + (frame as f64 / self.rate / self.tick).round() as i64
    }

    fn ensure_scaler(&mut self, frame: &ffmpeg::frame::Video) -> EngineResult<()> {
        let needs_recreate = match &self.scaler {
            None => true,
            Some(scaler) => {
                let input = scaler.input();
                input.format != frame.format() || input.width != frame.width() || input.height != frame.height()
            }
        };
        if needs_recreate {
            let scaler = ffmpeg::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg::format::Pixel::RGBA,
                frame.width(),
                frame.height(),
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| EngineError::decode(format!("scaler: {}", e)))?;
            self.scaler = Some(scaler);
        }
        Ok(())
    }

    fn to_image(&mut self, frame: &ffmpeg::frame::Video) -> EngineResult<Image> {
        self.ensure_scaler(frame)?;
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(EngineError::decode("scaler not initialized"));
        };
        let mut rgba = ffmpeg::frame::Video::empty();
        scaler.run(frame, &mut rgba).map_err(|e| EngineError::decode(format!("scale: {}", e)))?;

        let (width, height) = (rgba.width() as usize, rgba.height() as usize);
        let data = rgba.data(0);
        let stride = rgba.stride(0);
        let row_bytes = width * 4;
        let mut output = vec![0u8; row_bytes * height];
        for y in 0..height {
            let src = y * stride;
            let dst = y * row_bytes;
            output[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
        }
        Image::new(width, height, PixelBuffer::U8(output)).ok_or_else(|| EngineError::decode("bad RGBA frame size"))
    }
}

impl VideoDecoder for FfmpegVideo {
    fn seek(&mut self, frame: i64) -> EngineResult<()> {
        let target = self.frame_to_pts(frame);
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                self.stream_index as i32,
                target,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            return Err(EngineError::seek(format!("av_seek_frame to frame {} failed (ret={})", frame, ret)));
        }
        self.decoder.flush();
        self.eof_sent = false;
        // Half a frame of slack for pts rounding
        let half_frame = if self.tick > 0.0 { (0.5 / self.rate / self.tick) as i64 } else { 0 };
        self.target_pts = Some(target - half_frame);
        trace!("video seek: frame {} -> pts {}", frame, target);
        Ok(())
    }

    fn decode_next(&mut self) -> EngineResult<Option<Image>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().or(decoded.pts());
                    if let (Some(target), Some(pts)) = (self.target_pts, pts) {
                        if pts < target {
                            continue;
                        }
                    }
                    self.target_pts = None;
                    return self.to_image(&decoded).map(Some);
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) if is_again(&e) => {
                    if !feed(&mut self.input, self.stream_index, &mut self.decoder)? {
                        if self.eof_sent {
                            return Ok(None);
                        }
                        self.decoder.send_eof().map_err(|e| EngineError::decode(e.to_string()))?;
                        self.eof_sent = true;
                    }
                }
                Err(e) => return Err(EngineError::decode(e.to_string())),
            }
        }
    }
}

struct FfmpegAudio {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<ffmpeg::software::resampling::Context>,
    format: AudioFormat,
    tick: f64,
    start_pts: i64,
    /// Output sample the next chunk must start at, after a seek
    skip_to: Option<i64>,
    eof_sent: bool,
}

impl FfmpegAudio {
    fn ensure_resampler(&mut self, frame: &ffmpeg::frame::Audio) -> EngineResult<()> {
        let src_layout = if frame.channel_layout().is_empty() {
            ffmpeg::ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };
        let needs_recreate = match &self.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != frame.format() || input.rate != frame.rate() || input.channel_layout != src_layout
            }
        };
        if needs_recreate {
            let resampler = ffmpeg::software::resampling::Context::get(
                frame.format(),
                src_layout,
                frame.rate(),
                ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
                ffmpeg::ChannelLayout::default(self.format.channels as i32),
                self.format.sample_rate,
            )
            .map_err(|e| EngineError::decode(format!("resampler: {}", e)))?;
            self.resampler = Some(resampler);
        }
        Ok(())
    }

    fn to_samples(&mut self, frame: &ffmpeg::frame::Audio) -> EngineResult<Vec<f32>> {
        self.ensure_resampler(frame)?;
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(EngineError::decode("resampler not initialized"));
        };
        let mut output = ffmpeg::frame::Audio::empty();
        resampler
            .run(frame, &mut output)
            .map_err(|e| EngineError::decode(format!("resample: {}", e)))?;

        let count = output.samples() * self.format.channels as usize;
        Ok(output
            .data(0)
            .chunks_exact(4)
            .take(count)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Output sample index of a decoded frame's first sample
    fn sample_of(&self, pts: i64) -> i64 {
        ((pts - self.start_pts) as f64 * self.tick * self.format.sample_rate as f64).round() as i64
    }
}

impl AudioDecoder for FfmpegAudio {
    fn seek(&mut self, sample: i64) -> EngineResult<()> {
        let seconds = sample as f64 / self.format.sample_rate as f64;
        let timestamp = (seconds * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        self.input
            .seek(timestamp, ..)
            .map_err(|e| EngineError::seek(format!("audio seek to sample {}: {}", sample, e)))?;
        self.decoder.flush();
        // Drop filter history from before the seek
        self.resampler = None;
        self.eof_sent = false;
        self.skip_to = Some(sample);
        Ok(())
    }

    fn decode_next(&mut self) -> EngineResult<Option<Vec<f32>>> {
        let mut decoded = ffmpeg::frame::Audio::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().or(decoded.pts());
                    let mut samples = self.to_samples(&decoded)?;
                    if samples.is_empty() {
                        continue;
                    }
                    if let Some(target) = self.skip_to {
                        let channels = self.format.channels.max(1) as usize;
                        let start = pts.map_or(target, |p| self.sample_of(p));
                        let count = (samples.len() / channels) as i64;
                        if start + count <= target {
                            continue;
                        }
                        let skip = (target - start).max(0) as usize * channels;
                        samples.drain(..skip.min(samples.len()));
                        self.skip_to = None;
                    }
                    return Ok(Some(samples));
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) if is_again(&e) => {
                    if !feed(&mut self.input, self.stream_index, &mut self.decoder)? {
                        if self.eof_sent {
                            return Ok(None);
                        }
                        self.decoder.send_eof().map_err(|e| EngineError::decode(e.to_string()))?;
                        self.eof_sent = true;
                    }
                }
                Err(e) => return Err(EngineError::decode(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_containers_only() {
        let backend = FfmpegBackend::new();
        assert!(backend.supports(Path::new("/shots/a.MOV")));
        assert!(backend.supports(Path::new("music.wav")));
        assert!(!backend.supports(Path::new("plate.0001.exr")));
    }

    #[test]
    fn test_probe_missing_file() {
        let backend = FfmpegBackend::new();
        let err = backend.probe(Path::new("/no/such/clip.mov")).unwrap_err();
        assert!(matches!(err, EngineError::Open { .. }));
    }
}
