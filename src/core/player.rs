//! Timeline orchestrator: turns "frame at time t" into a composited `Frame`.
//!
//! **Architecture**: `Player` is a thin, thread-safe handle. All real work
//! happens on one `player-tick` thread that owns the `ReaderPool` and the
//! active ranges; callers only talk to it through an inbound command queue.
//!
//! **Used by**: CLI driver, any renderer/playback loop
//!
//! # Tick
//!
//! Each tick:
//! 1. Drain inbound commands (frame/audio requests, active ranges, cancel).
//!    A frame request resolves every video track at `t`, opens readers on
//!    demand and issues one sub-request per image (two during a dissolve).
//! 2. Poll in-flight frames without blocking; a frame whose sub-tickets are
//!    all ready is assembled and delivered.
//! 3. Stop pass, then reap pass on the pool.
//!
//! The inbound wait shortens to `tick_wait` while anything is in flight.
//!
//! # Cancellation
//!
//! `cancel_pending()` bumps an epoch (same idea as stale-request epochs in a
//! worker pool): requests submitted before the bump complete empty, in-flight
//! frames are dropped and queued reader work is cancelled. The sweep runs on
//! the first command of the new epoch, whether that is the `Cancel` itself or
//! a request that raced ahead of it.
//!
//! Times outside the timeline get an already-completed empty frame without a
//! round trip through the tick.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::promise::{self, Promise, Ticket};
use super::reader_pool::ReaderPool;
use crate::config::EngineConfig;
use crate::decode::DecoderBackend;
use crate::entities::{
    AudioFrame, AudioLayer, AudioUnit, Clip, Frame, FrameLayer, Timeline, TimelineLayout, TrackKind, TransitionKind,
    VideoFrame,
};
use crate::error::EngineResult;
use crate::time::{RationalTime, TimeRange};

/// Snapshot of the tick thread's bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub live_readers: usize,
    pub stopping_readers: usize,
    pub in_flight_frames: usize,
    pub readers_opened: usize,
    pub frames_delivered: u64,
    pub frames_cancelled: u64,
}

enum Command {
    Frame {
        time: RationalTime,
        epoch: u64,
        promise: Promise<Frame>,
    },
    Audio {
        range: TimeRange,
        epoch: u64,
        promise: Promise<AudioFrame>,
    },
    ActiveRanges(Vec<TimeRange>),
    Cancel,
    Shutdown,
}

/// Thread-safe handle to a playing timeline
pub struct Player {
    timeline: Arc<Timeline>,
    tx: Sender<Command>,
    epoch: Arc<AtomicU64>,
    stats: Arc<Mutex<PlayerStats>>,
    thread: Option<JoinHandle<()>>,
}

impl Player {
    /// Validate `timeline` and start the tick thread
    pub fn new(timeline: Timeline, backend: Arc<dyn DecoderBackend>, config: &EngineConfig) -> EngineResult<Self> {
        timeline.validate()?;
        config.validate()?;

        let timeline = Arc::new(timeline);
        let (tx, rx) = unbounded();
        let epoch = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(Mutex::new(PlayerStats::default()));

        let pool = ReaderPool::new(backend, config.reader_options(), timeline.media_usage());
        let tick = Tick {
            layout: timeline.layout(),
            timeline: Arc::clone(&timeline),
            pool,
            rx,
            epoch: Arc::clone(&epoch),
            seen_epoch: 0,
            frames: Vec::new(),
            audio: Vec::new(),
            stats: Arc::clone(&stats),
            delivered: 0,
            cancelled: 0,
            tick_wait: config.tick_wait(),
            idle_wait: config.idle_tick_wait(),
        };

        let thread = thread::Builder::new().name("player-tick".into()).spawn(move || tick.run())?;

        info!(
            "Player started: '{}' ({} tracks, {} media files, duration {})",
            timeline.name,
            timeline.tracks.len(),
            timeline.media_usage().len(),
            timeline.duration()
        );

        Ok(Self {
            timeline,
            tx,
            epoch,
            stats,
            thread: Some(thread),
        })
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Composited frame at timeline time `time`
    pub fn request_frame(&self, time: RationalTime) -> Ticket<Frame> {
        if !self.timeline.range().contains(time) {
            trace!("Frame {} outside timeline, empty", time);
            return Ticket::ready(Frame::empty(time));
        }
        let (promise, ticket) = promise::pair();
        let epoch = self.epoch.load(Ordering::Acquire);
        // A failed send drops the promise, which completes the ticket empty
        let _ = self.tx.send(Command::Frame { time, epoch, promise });
        ticket
    }

    /// Per-track audio covering `range` (no mixing)
    pub fn request_audio(&self, range: TimeRange) -> Ticket<AudioFrame> {
        let (promise, ticket) = promise::pair();
        let epoch = self.epoch.load(Ordering::Acquire);
        let _ = self.tx.send(Command::Audio { range, epoch, promise });
        ticket
    }

    /// Timeline ranges currently in view; drives reader retirement
    pub fn set_active_ranges(&self, ranges: Vec<TimeRange>) {
        let _ = self.tx.send(Command::ActiveRanges(ranges));
    }

    /// Complete every outstanding request empty
    pub fn cancel_pending(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send(Command::Cancel);
    }

    pub fn stats(&self) -> PlayerStats {
        self.stats.lock().clone()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("player-tick panicked during join");
            }
        }
        debug!("Player dropped");
    }
}

/// Sub-requests for one video track
struct PendingLayer {
    image: Option<Ticket<VideoFrame>>,
    image_b: Option<Ticket<VideoFrame>>,
    transition: TransitionKind,
    value: f32,
}

impl PendingLayer {
    fn is_ready(&self) -> bool {
        self.image.as_ref().is_none_or(|t| t.is_ready()) && self.image_b.as_ref().is_none_or(|t| t.is_ready())
    }

    /// Assembled layer; `None` when neither image decoded
    fn take(self) -> Option<FrameLayer> {
        let take = |ticket: Option<Ticket<VideoFrame>>| {
            ticket.and_then(|mut t| t.try_take()).flatten().map(|f| f.image)
        };
        let layer = FrameLayer {
            image: take(self.image),
            image_b: take(self.image_b),
            transition: self.transition,
            transition_value: self.value,
        };
        layer.has_image().then_some(layer)
    }
}

struct InFlightFrame {
    time: RationalTime,
    epoch: u64,
    layers: Vec<PendingLayer>,
    promise: Promise<Frame>,
}

struct InFlightAudio {
    range: TimeRange,
    epoch: u64,
    layers: Vec<Ticket<AudioUnit>>,
    promise: Promise<AudioFrame>,
}

/// State owned by the tick thread
struct Tick {
    timeline: Arc<Timeline>,
    layout: TimelineLayout,
    pool: ReaderPool,
    rx: Receiver<Command>,
    epoch: Arc<AtomicU64>,
    seen_epoch: u64,
    frames: Vec<InFlightFrame>,
    audio: Vec<InFlightAudio>,
    stats: Arc<Mutex<PlayerStats>>,
    delivered: u64,
    cancelled: u64,
    tick_wait: Duration,
    idle_wait: Duration,
}

impl Tick {
    fn run(mut self) {
        let result = catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        if let Err(e) = result {
            let msg = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("player-tick panicked: {}", msg);
        }
        self.shutdown();
    }

    fn run_loop(&mut self) {
        loop {
            let busy = !self.frames.is_empty() || !self.audio.is_empty();
            let wait = if busy { self.tick_wait } else { self.idle_wait };

            match self.rx.recv_timeout(wait) {
                Ok(command) => {
                    if !self.handle(command) {
                        return;
                    }
                    while let Ok(command) = self.rx.try_recv() {
                        if !self.handle(command) {
                            return;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }

            self.poll_in_flight();
            let stopped = self.pool.stop_pass();
            let reaped = self.pool.reap_pass();
            if stopped + reaped > 0 {
                debug!("Lifecycle: stopped {}, reaped {}", stopped, reaped);
            }
            self.publish_stats();
        }
    }

    /// Returns false on shutdown
    fn handle(&mut self, command: Command) -> bool {
        let current = self.epoch.load(Ordering::Acquire);
        match command {
            Command::Frame { time, epoch, promise } => {
                if epoch < current {
                    self.cancelled += 1;
                    promise.cancel();
                } else {
                    // Can overtake its Cancel: sweep before issuing sub-requests
                    self.cancel_stale(current);
                    self.start_frame(time, epoch, promise);
                }
            }
            Command::Audio { range, epoch, promise } => {
                if epoch < current {
                    promise.cancel();
                } else {
                    self.cancel_stale(current);
                    self.start_audio(range, epoch, promise);
                }
            }
            Command::ActiveRanges(ranges) => self.pool.set_active_ranges(ranges),
            Command::Cancel => self.cancel_stale(current),
            Command::Shutdown => return false,
        }
        true
    }

    /// Drop work from epochs before `current`; runs once per epoch
    fn cancel_stale(&mut self, current: u64) {
        if self.seen_epoch == current {
            return;
        }
        self.seen_epoch = current;
        let before = self.frames.len() + self.audio.len();
        // Dropping the in-flight entries completes their promises empty
        self.frames.retain(|f| f.epoch >= current);
        self.audio.retain(|a| a.epoch >= current);
        let dropped = before - self.frames.len() - self.audio.len();
        self.cancelled += dropped as u64;
        let queued = self.pool.cancel_all();
        debug!("Cancelled {} in-flight requests, {} queued reader requests", dropped, queued);
    }

    fn start_frame(&mut self, time: RationalTime, epoch: u64, promise: Promise<Frame>) {
        let track_time = self.layout.to_track_time(time);
        let timeline = Arc::clone(&self.timeline);
        let mut layers = Vec::new();

        for (track, track_layout) in timeline.tracks.iter().zip(&self.layout.tracks) {
            if track.kind != TrackKind::Video {
                continue;
            }
            let Some(coverage) = track_layout.resolve(track, track_time) else {
                continue;
            };
            let image = request_clip(&mut self.pool, coverage.clip, &coverage.range, track_time, false);
            let (image_b, transition, value) = match coverage.blend {
                Some(blend) => (
                    request_clip(&mut self.pool, blend.clip, &blend.range, track_time, true),
                    blend.kind,
                    blend.value,
                ),
                None => (None, TransitionKind::None, 0.0),
            };
            layers.push(PendingLayer {
                image,
                image_b,
                transition,
                value,
            });
        }

        trace!("Frame {} -> {} layer requests", time, layers.len());
        if layers.is_empty() {
            self.delivered += 1;
            promise.complete(Frame::empty(time));
            return;
        }
        self.frames.push(InFlightFrame {
            time,
            epoch,
            layers,
            promise,
        });
    }

    fn start_audio(&mut self, range: TimeRange, epoch: u64, promise: Promise<AudioFrame>) {
        let start = self.layout.to_track_time(range.start_time);
        let end = start + range.duration;
        let timeline = Arc::clone(&self.timeline);
        let mut layers = Vec::new();

        for (track, track_layout) in timeline.tracks.iter().zip(&self.layout.tracks) {
            if track.kind != TrackKind::Audio {
                continue;
            }
            let Some(coverage) = track_layout.resolve(track, start) else {
                continue;
            };
            // Clip the span to the clip's trimmed range
            let clip_end = coverage.range.end_time_exclusive();
            let span_end = if end < clip_end { end } else { clip_end };
            let local = TimeRange::from_start_end(
                coverage.clip.local_time(start, &coverage.range),
                coverage.clip.local_time(span_end, &coverage.range),
            );
            if let Some(reader) = self.pool.get_or_open(coverage.clip.path()) {
                layers.push(reader.request_audio(local));
            }
        }

        if layers.is_empty() {
            promise.complete(AudioFrame {
                range,
                layers: Vec::new(),
            });
            return;
        }
        self.audio.push(InFlightAudio {
            range,
            epoch,
            layers,
            promise,
        });
    }

    fn poll_in_flight(&mut self) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.frames).into_iter().partition(|f| f.layers.iter().all(|l| l.is_ready()));
        self.frames = waiting;
        for frame in ready {
            let layers: Vec<FrameLayer> = frame.layers.into_iter().filter_map(PendingLayer::take).collect();
            trace!("Frame {} assembled with {} layers", frame.time, layers.len());
            self.delivered += 1;
            frame.promise.complete(Frame {
                time: frame.time,
                layers,
            });
        }

        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.audio).into_iter().partition(|a| a.layers.iter().all(|t| t.is_ready()));
        self.audio = waiting;
        for audio in ready {
            let layers = audio
                .layers
                .into_iter()
                .filter_map(|mut t| t.try_take().flatten())
                .map(|unit| AudioLayer { audio: unit })
                .collect();
            audio.promise.complete(AudioFrame {
                range: audio.range,
                layers,
            });
        }
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock();
        stats.live_readers = self.pool.live_count();
        stats.stopping_readers = self.pool.stopping_count();
        stats.in_flight_frames = self.frames.len();
        stats.readers_opened = self.pool.opened_count();
        stats.frames_delivered = self.delivered;
        stats.frames_cancelled = self.cancelled;
    }

    fn shutdown(&mut self) {
        let outstanding = self.frames.len() + self.audio.len();
        self.frames.clear();
        self.audio.clear();
        // Requests that never reached the loop complete empty as they drop
        let unserved = self.rx.try_iter().count();
        self.pool.shutdown();
        self.publish_stats();
        info!(
            "player-tick stopped ({} in-flight and {} queued requests completed empty)",
            outstanding, unserved
        );
    }
}

/// Issue the sub-request for `clip` at `track_time`.
///
/// `hold` clamps into the media's frames: a dissolve neighbour is decoded
/// outside its own trimmed range and falls back to its first/last frame.
fn request_clip(
    pool: &mut ReaderPool,
    clip: &Clip,
    range: &TimeRange,
    track_time: RationalTime,
    hold: bool,
) -> Option<Ticket<VideoFrame>> {
    let local = clip.local_time(track_time, range);
    let reader = pool.get_or_open(clip.path())?;
    let video = reader.info().video.as_ref()?;
    let mut frame = local.rescaled_to(video.rate).floor();
    if hold && !video.still {
        frame = video.range.clamped(frame);
    }
    Some(reader.request_video(frame))
}
