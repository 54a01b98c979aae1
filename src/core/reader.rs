//! Per-file asynchronous decoder.
//!
//! **Why**: each source file gets its own decode thread(s) and request queue so
//! one slow clip never delays another. Callers get a `Ticket` back immediately
//! and the worker completes it in submission order.
//!
//! **Used by**: `ReaderPool` (owned), `Player` (through the pool)
//!
//! # Threads
//!
//! One worker per stream present in the file:
//! - `reader-video:<file>`: frame requests, read-ahead, recent-frame LRU
//! - `reader-audio:<file>`: sample-range requests over a sample FIFO
//!
//! Each worker waits on its own queue (`parking_lot` mutex + condvar) with a
//! bounded timeout, so a stop request is observed within `queue_wait`.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──open──▶ Active ──stop()──▶ Stopping ──last worker exits──▶ Stopped
//! ```
//!
//! `stop()` only flips the state; workers drain their queues with empty
//! results and exit on their own. `has_stopped()` polls without blocking.
//! `Drop` joins the threads, so dropping an `Active` reader may block.

use log::{debug, error, info, trace, warn};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::promise::{self, Promise, Ticket};
use crate::config::ReaderOptions;
use crate::decode::{AudioDecoder, AudioFormat, DecoderBackend, MediaInfo, VideoDecoder, VideoInfo};
use crate::entities::{AudioUnit, Image, VideoFrame};
use crate::error::{EngineError, EngineResult};
use crate::time::{RationalTime, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Created = 0,
    Active = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ReaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReaderState::Created,
            1 => ReaderState::Active,
            2 => ReaderState::Stopping,
            _ => ReaderState::Stopped,
        }
    }
}

/// State shared between the handle and its workers
struct Shared {
    state: AtomicU8,
    live_workers: AtomicUsize,
}

impl Shared {
    fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state() == ReaderState::Active
    }
}

/// Decrements the pending count when its request is dropped
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct VideoRequest {
    frame: i64,
    promise: Promise<VideoFrame>,
    _pending: PendingGuard,
}

struct AudioRequest {
    start: i64,
    count: i64,
    promise: Promise<AudioUnit>,
    _pending: PendingGuard,
}

trait Request {
    fn cancel(self);
}

impl Request for VideoRequest {
    fn cancel(self) {
        self.promise.cancel();
    }
}

impl Request for AudioRequest {
    fn cancel(self) {
        self.promise.cancel();
    }
}

struct LaneState<R> {
    requests: VecDeque<R>,
    /// Worker has exited; nothing will serve new requests
    closed: bool,
}

/// One worker's request queue
struct Lane<R> {
    state: Mutex<LaneState<R>>,
    wake: Condvar,
}

impl<R: Request> Lane<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                requests: VecDeque::new(),
                closed: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Queue a request; rejects (and cancels) it once the reader is no longer active
    fn push(&self, shared: &Shared, request: R) -> bool {
        let mut lane = self.state.lock();
        if lane.closed || !shared.is_active() {
            drop(lane);
            request.cancel();
            return false;
        }
        lane.requests.push_back(request);
        self.wake.notify_one();
        true
    }

    fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Swap out every queued request and complete them empty
    fn cancel_all(&self) -> usize {
        let drained = std::mem::take(&mut self.state.lock().requests);
        let count = drained.len();
        for request in drained {
            request.cancel();
        }
        count
    }

    /// Mark closed and cancel what is left
    fn close(&self) -> usize {
        let drained = {
            let mut lane = self.state.lock();
            lane.closed = true;
            std::mem::take(&mut lane.requests)
        };
        let count = drained.len();
        for request in drained {
            request.cancel();
        }
        count
    }
}

/// Handle to one open media file and its decode threads
pub struct Reader {
    path: PathBuf,
    info: MediaInfo,
    shared: Arc<Shared>,
    pending: Arc<AtomicUsize>,
    video: Option<Arc<Lane<VideoRequest>>>,
    audio: Option<Arc<Lane<AudioRequest>>>,
    audio_format: AudioFormat,
    threads: Vec<JoinHandle<()>>,
}

impl Reader {
    /// Probe `path` and start one worker per stream
    pub fn open(path: &Path, backend: Arc<dyn DecoderBackend>, options: ReaderOptions) -> EngineResult<Self> {
        let info = backend.probe(path)?;
        Self::with_info(info, backend, options)
    }

    /// Start workers for an already-probed file
    pub fn with_info(info: MediaInfo, backend: Arc<dyn DecoderBackend>, options: ReaderOptions) -> EngineResult<Self> {
        if !info.has_video() && !info.has_audio() {
            return Err(EngineError::probe(&info.path, "no video or audio stream"));
        }

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ReaderState::Created as u8),
            live_workers: AtomicUsize::new(0),
        });
        let mut reader = Self {
            path: info.path.clone(),
            video: info.video.as_ref().map(|_| Arc::new(Lane::new())),
            audio: info.audio.as_ref().map(|_| Arc::new(Lane::new())),
            info,
            shared,
            pending: Arc::new(AtomicUsize::new(0)),
            audio_format: options.audio,
            threads: Vec::new(),
        };
        reader.shared.state.store(ReaderState::Active as u8, Ordering::Release);

        let file = reader
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reader.path.display().to_string());

        if let (Some(lane), Some(video)) = (&reader.video, &reader.info.video) {
            let worker = VideoWorker::new(video.clone(), &options);
            let ctx = WorkerContext {
                name: format!("reader-video:{file}"),
                shared: Arc::clone(&reader.shared),
                pending: Arc::clone(&reader.pending),
                lane: Arc::clone(lane),
                options: options.clone(),
            };
            let backend = Arc::clone(&backend);
            let info = reader.info.clone();
            let handle = spawn_worker(ctx, move |ctx| {
                let decoder = backend.open_video(&info);
                worker.run(ctx, decoder);
            })?;
            reader.threads.push(handle);
        }

        if let (Some(lane), Some(_)) = (&reader.audio, &reader.info.audio) {
            let worker = AudioWorker::new(options.audio);
            let ctx = WorkerContext {
                name: format!("reader-audio:{file}"),
                shared: Arc::clone(&reader.shared),
                pending: Arc::clone(&reader.pending),
                lane: Arc::clone(lane),
                options: options.clone(),
            };
            let backend = Arc::clone(&backend);
            let info = reader.info.clone();
            let format = options.audio;
            let handle = spawn_worker(ctx, move |ctx| {
                let decoder = backend.open_audio(&info, format);
                worker.run(ctx, decoder);
            })?;
            reader.threads.push(handle);
        }

        info!(
            "Reader opened: {} (video: {}, audio: {})",
            reader.path.display(),
            reader.info.has_video(),
            reader.info.has_audio()
        );
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Requests queued or being served
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Requests still waiting in the queues
    pub fn queued(&self) -> usize {
        self.video.as_ref().map_or(0, |l| l.len()) + self.audio.as_ref().map_or(0, |l| l.len())
    }

    /// Ask for the frame at `time` (media time, any rate)
    pub fn request_video(&self, time: RationalTime) -> Ticket<VideoFrame> {
        let (Some(lane), Some(video)) = (&self.video, &self.info.video) else {
            return Ticket::empty();
        };
        if !self.shared.is_active() {
            trace!("{}: rejecting video request, reader {:?}", self.path.display(), self.state());
            return Ticket::empty();
        }
        let frame = time.rescaled_to(video.rate).to_units();
        let (promise, ticket) = promise::pair();
        let request = VideoRequest {
            frame,
            promise,
            _pending: PendingGuard::new(&self.pending),
        };
        trace!("{}: request frame {}", self.path.display(), frame);
        lane.push(&self.shared, request);
        ticket
    }

    /// Ask for samples covering `range`, at the reader's output format
    pub fn request_audio(&self, range: TimeRange) -> Ticket<AudioUnit> {
        let Some(lane) = &self.audio else {
            return Ticket::empty();
        };
        if !self.shared.is_active() {
            trace!("{}: rejecting audio request, reader {:?}", self.path.display(), self.state());
            return Ticket::empty();
        }
        let rate = self.audio_format.sample_rate as f64;
        let start = range.start_time.rescaled_to(rate).to_units();
        let count = range.duration.rescaled_to(rate).round().value as i64;
        let (promise, ticket) = promise::pair();
        let request = AudioRequest {
            start,
            count,
            promise,
            _pending: PendingGuard::new(&self.pending),
        };
        trace!("{}: request samples {}+{}", self.path.display(), start, count);
        lane.push(&self.shared, request);
        ticket
    }

    /// Complete every queued request empty; the one being decoded still finishes
    pub fn cancel_all(&self) -> usize {
        let cancelled =
            self.video.as_ref().map_or(0, |l| l.cancel_all()) + self.audio.as_ref().map_or(0, |l| l.cancel_all());
        if cancelled > 0 {
            debug!("{}: cancelled {} queued requests", self.path.display(), cancelled);
        }
        cancelled
    }

    /// Request shutdown without blocking. Returns false if not active.
    pub fn stop(&self) -> bool {
        let switched = self
            .shared
            .state
            .compare_exchange(
                ReaderState::Active as u8,
                ReaderState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if switched {
            debug!("{}: stopping", self.path.display());
            if let Some(lane) = &self.video {
                lane.wake.notify_all();
            }
            if let Some(lane) = &self.audio {
                lane.wake.notify_all();
            }
        }
        switched
    }

    /// True once every worker has exited (joining will not block)
    pub fn has_stopped(&self) -> bool {
        self.state() == ReaderState::Stopped
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("{}: worker thread panicked during join", self.path.display());
            }
        }
        trace!("Reader dropped: {}", self.path.display());
    }
}

struct WorkerContext<R> {
    name: String,
    shared: Arc<Shared>,
    pending: Arc<AtomicUsize>,
    lane: Arc<Lane<R>>,
    options: ReaderOptions,
}

impl<R: Request> WorkerContext<R> {
    /// Next request, waiting at most `queue_wait` when `idle` says there is nothing else to do
    fn next_request(&self, idle: bool) -> Option<R> {
        let mut lane = self.lane.state.lock();
        if lane.requests.is_empty() && idle && self.shared.is_active() {
            self.lane.wake.wait_for(&mut lane, self.options.queue_wait);
        }
        lane.requests.pop_front()
    }

    fn is_active(&self) -> bool {
        self.shared.is_active()
    }
}

/// Spawn a worker with the catch-and-log envelope, final drain and exit bookkeeping
fn spawn_worker<R, F>(ctx: WorkerContext<R>, body: F) -> EngineResult<JoinHandle<()>>
where
    R: Request + Send + 'static,
    F: FnOnce(&WorkerContext<R>) + Send + 'static,
{
    let shared = Arc::clone(&ctx.shared);
    shared.live_workers.fetch_add(1, Ordering::AcqRel);

    let spawned = thread::Builder::new().name(ctx.name.clone()).spawn(move || {
        trace!("{} started", ctx.name);
        let result = catch_unwind(AssertUnwindSafe(|| body(&ctx)));
        if let Err(e) = result {
            let msg = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("{} panicked: {}", ctx.name, msg);
        }

        // A worker leaving while active has died; the whole reader winds down
        let was_active = ctx
            .shared
            .state
            .compare_exchange(
                ReaderState::Active as u8,
                ReaderState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if was_active {
            warn!("{} exited while active, stopping reader", ctx.name);
        }

        let drained = ctx.lane.close();
        if drained > 0 {
            debug!("{}: completed {} queued requests empty on exit", ctx.name, drained);
        }

        if ctx.shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            ctx.shared.state.store(ReaderState::Stopped as u8, Ordering::Release);
        }
        trace!("{} finished", ctx.name);
    });

    spawned.map_err(|e| {
        shared.live_workers.fetch_sub(1, Ordering::AcqRel);
        EngineError::Io(e)
    })
}

/// Periodic queue-depth line, observability only
struct Diagnostics {
    last: Instant,
    served: u64,
    seeks: u64,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            last: Instant::now(),
            served: 0,
            seeks: 0,
        }
    }

    fn maybe_log<R: Request>(&mut self, ctx: &WorkerContext<R>, buffered: usize) {
        if ctx.options.diagnostics_interval.is_zero() || self.last.elapsed() < ctx.options.diagnostics_interval {
            return;
        }
        self.last = Instant::now();
        debug!(
            "{}: pending={} queued={} buffered={} served={} seeks={}",
            ctx.name,
            ctx.pending.load(Ordering::Acquire),
            ctx.lane.len(),
            buffered,
            self.served,
            self.seeks
        );
    }
}

struct VideoWorker {
    info: VideoInfo,
    read_ahead_depth: usize,
    /// Frame the decoder yields next; `None` forces a seek
    next_frame: Option<i64>,
    read_ahead: VecDeque<(i64, Arc<Image>)>,
    recent: Option<LruCache<i64, Arc<Image>>>,
    eof: bool,
    diag: Diagnostics,
}

impl VideoWorker {
    fn new(info: VideoInfo, options: &ReaderOptions) -> Self {
        Self {
            info,
            read_ahead_depth: options.video_read_ahead,
            next_frame: None,
            read_ahead: VecDeque::new(),
            recent: NonZeroUsize::new(options.recent_frame_cache).map(LruCache::new),
            eof: false,
            diag: Diagnostics::new(),
        }
    }

    fn run(mut self, ctx: &WorkerContext<VideoRequest>, decoder: EngineResult<Box<dyn VideoDecoder>>) {
        let mut decoder = match decoder {
            Ok(d) => Some(d),
            Err(e) => {
                error!("{}: failed to open decoder: {}", ctx.name, e);
                None
            }
        };

        while ctx.is_active() {
            let can_prefetch = decoder.is_some() && self.can_prefetch();
            let request = ctx.next_request(!can_prefetch);
            self.diag.maybe_log(ctx, self.read_ahead.len());

            match (request, decoder.as_deref_mut()) {
                (Some(request), Some(decoder)) => self.serve(ctx, decoder, request),
                // Open failed: every request completes empty
                (Some(request), None) => request.cancel(),
                (None, Some(decoder)) if can_prefetch => self.prefetch(ctx, decoder),
                (None, _) => {}
            }
        }
        debug!("{}: loop exit, served {} seeks {}", ctx.name, self.diag.served, self.diag.seeks);
    }

    fn can_prefetch(&self) -> bool {
        !self.eof && self.next_frame.is_some() && self.read_ahead.len() < self.read_ahead_depth
    }

    fn serve(&mut self, ctx: &WorkerContext<VideoRequest>, decoder: &mut dyn VideoDecoder, request: VideoRequest) {
        let frame = request.frame;
        if !self.info.has_frame(frame) {
            trace!("{}: frame {} outside media", ctx.name, frame);
            request.cancel();
            return;
        }

        let cached = self.recent.as_mut().and_then(|lru| lru.get(&frame).cloned());
        let image = match cached {
            Some(image) => Some(image),
            None => self.produce(ctx, decoder, frame),
        };

        let delivered = image.map(|image| {
            if let Some(lru) = self.recent.as_mut() {
                lru.put(frame, Arc::clone(&image));
            }
            self.diag.served += 1;
            VideoFrame {
                time: RationalTime::new(frame as f64, self.info.rate),
                image,
            }
        });
        request.promise.resolve(delivered);
    }

    /// Decode (or pop from read-ahead) exactly `frame`
    fn produce(&mut self, ctx: &WorkerContext<VideoRequest>, decoder: &mut dyn VideoDecoder, frame: i64) -> Option<Arc<Image>> {
        while self.read_ahead.front().is_some_and(|(n, _)| *n < frame) {
            self.read_ahead.pop_front();
        }
        if self.read_ahead.front().is_some_and(|(n, _)| *n == frame) {
            return self.read_ahead.pop_front().map(|(_, image)| image);
        }

        let depth = self.read_ahead_depth as i64;
        let within_reach = self.read_ahead.is_empty()
            && self.next_frame.is_some_and(|next| next <= frame && frame - next <= depth);

        if within_reach && self.eof {
            return None;
        }
        if !within_reach {
            debug!("{}: seek {:?} -> {}", ctx.name, self.next_frame, frame);
            self.read_ahead.clear();
            self.eof = false;
            self.diag.seeks += 1;
            if let Err(e) = decoder.seek(frame) {
                warn!("{}: seek to {} failed: {}", ctx.name, frame, e);
                self.next_frame = None;
                return None;
            }
            self.next_frame = Some(frame);
        }

        loop {
            match decoder.decode_next() {
                Ok(Some(image)) => {
                    let n = self.next_frame.unwrap_or(frame);
                    self.next_frame = Some(n + 1);
                    if n >= frame {
                        return Some(Arc::new(image));
                    }
                }
                Ok(None) => {
                    trace!("{}: end of stream before frame {}", ctx.name, frame);
                    self.eof = true;
                    return None;
                }
                Err(e) => {
                    warn!("{}: decode of frame {} failed: {}", ctx.name, frame, e);
                    self.next_frame = None;
                    return None;
                }
            }
        }
    }

    fn prefetch(&mut self, ctx: &WorkerContext<VideoRequest>, decoder: &mut dyn VideoDecoder) {
        let Some(n) = self.next_frame else {
            return;
        };
        match decoder.decode_next() {
            Ok(Some(image)) => {
                self.read_ahead.push_back((n, Arc::new(image)));
                self.next_frame = Some(n + 1);
            }
            Ok(None) => self.eof = true,
            Err(e) => {
                warn!("{}: read-ahead of frame {} failed: {}", ctx.name, n, e);
                self.read_ahead.clear();
                self.next_frame = None;
            }
        }
    }
}

struct AudioWorker {
    format: AudioFormat,
    /// Sample index of the FIFO's first sample frame; `None` forces a seek
    fifo_start: Option<i64>,
    fifo: VecDeque<f32>,
    eof: bool,
    diag: Diagnostics,
}

impl AudioWorker {
    fn new(format: AudioFormat) -> Self {
        Self {
            format,
            fifo_start: None,
            fifo: VecDeque::new(),
            eof: false,
            diag: Diagnostics::new(),
        }
    }

    fn channels(&self) -> usize {
        self.format.channels.max(1) as usize
    }

    /// Sample frames currently buffered
    fn buffered(&self) -> i64 {
        (self.fifo.len() / self.channels()) as i64
    }

    fn run(mut self, ctx: &WorkerContext<AudioRequest>, decoder: EngineResult<Box<dyn AudioDecoder>>) {
        let mut decoder = match decoder {
            Ok(d) => Some(d),
            Err(e) => {
                error!("{}: failed to open decoder: {}", ctx.name, e);
                None
            }
        };

        while ctx.is_active() {
            let request = ctx.next_request(true);
            self.diag.maybe_log(ctx, self.buffered() as usize);
            match (request, decoder.as_deref_mut()) {
                (Some(request), Some(decoder)) => self.serve(ctx, decoder, request),
                (Some(request), None) => request.cancel(),
                (None, _) => {}
            }
        }
        debug!("{}: loop exit, served {} seeks {}", ctx.name, self.diag.served, self.diag.seeks);
    }

    fn serve(&mut self, ctx: &WorkerContext<AudioRequest>, decoder: &mut dyn AudioDecoder, request: AudioRequest) {
        let (start, count) = (request.start, request.count);
        if count <= 0 || start < 0 {
            request.cancel();
            return;
        }
        let channels = self.channels();

        // Skip forward inside the FIFO, otherwise reposition
        match self.fifo_start {
            Some(s) if s <= start && start <= s + self.buffered() => {
                let skip = ((start - s) as usize * channels).min(self.fifo.len());
                self.fifo.drain(..skip);
                self.fifo_start = Some(start);
            }
            _ => {
                debug!("{}: seek {:?} -> {}", ctx.name, self.fifo_start, start);
                self.diag.seeks += 1;
                self.fifo.clear();
                self.eof = false;
                if let Err(e) = decoder.seek(start) {
                    warn!("{}: seek to sample {} failed: {}", ctx.name, start, e);
                    self.fifo_start = None;
                    request.cancel();
                    return;
                }
                self.fifo_start = Some(start);
            }
        }

        while self.buffered() < count && !self.eof {
            match decoder.decode_next() {
                Ok(Some(chunk)) => self.fifo.extend(chunk),
                Ok(None) => self.eof = true,
                Err(e) => {
                    warn!("{}: audio decode at sample {} failed: {}", ctx.name, start, e);
                    self.fifo.clear();
                    self.fifo_start = None;
                    request.cancel();
                    return;
                }
            }
        }

        let taken = count.min(self.buffered());
        if taken == 0 {
            request.cancel();
            return;
        }
        let samples: Vec<f32> = self.fifo.drain(..taken as usize * channels).collect();
        self.fifo_start = Some(start + taken);
        self.diag.served += 1;

        let rate = self.format.sample_rate as f64;
        request.promise.complete(AudioUnit {
            range: TimeRange::from_units(start as f64, taken as f64, rate),
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            samples,
        });
    }
}
