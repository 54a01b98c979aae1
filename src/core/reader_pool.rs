//! Reader lifecycle: open on demand, stop when out of range, reap when finished.
//!
//! **Why**: stopping a reader must never block the player tick on a thread
//! join. Retirement is split in two passes run every tick:
//!
//! 1. `stop_pass`: readers whose media is not needed by any active range and
//!    that have no pending requests get `stop()` and move to `stopping`.
//! 2. `reap_pass`: stopping readers whose workers have exited are dropped
//!    (joining a finished thread does not block).
//!
//! A reader that wound down on its own (worker panic) leaves the live set in
//! the stop pass and is reopened on next use.
//!
//! **Used by**: `Player` tick thread (sole owner, never shared)
//!
//! The pool is keyed by canonical path, so clips that spell the same file
//! differently still share one reader.

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::reader::{Reader, ReaderState};
use crate::config::ReaderOptions;
use crate::decode::DecoderBackend;
use crate::time::TimeRange;

pub struct ReaderPool {
    backend: Arc<dyn DecoderBackend>,
    options: ReaderOptions,
    live: IndexMap<PathBuf, Reader>,
    stopping: Vec<Reader>,
    /// Probe/open failures, remembered so a broken file is tried once
    failed: HashMap<PathBuf, String>,
    /// Caller-time ranges in which each media path is needed
    usage: IndexMap<PathBuf, Vec<TimeRange>>,
    /// `None` until the first `set_active_ranges`: nothing is retired before that
    active: Option<Vec<TimeRange>>,
    opened: usize,
    retired: usize,
}

/// Canonical identity of a media path (as written when it cannot be resolved)
pub fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl ReaderPool {
    pub fn new(backend: Arc<dyn DecoderBackend>, options: ReaderOptions, usage: IndexMap<PathBuf, Vec<TimeRange>>) -> Self {
        let mut canonical: IndexMap<PathBuf, Vec<TimeRange>> = IndexMap::new();
        for (path, ranges) in usage {
            canonical.entry(canonical_path(&path)).or_default().extend(ranges);
        }
        Self {
            backend,
            options,
            live: IndexMap::new(),
            stopping: Vec::new(),
            failed: HashMap::new(),
            usage: canonical,
            active: None,
            opened: 0,
            retired: 0,
        }
    }

    /// Live reader for `path`, opening it if needed.
    ///
    /// `None` if the file cannot be opened, or while a retired reader for the
    /// same file is still winding down: its replacement opens once the old
    /// threads have exited, so the tick never waits on a join.
    pub fn get_or_open(&mut self, path: &Path) -> Option<&Reader> {
        let key = canonical_path(path);
        if self.live.contains_key(&key) {
            return self.live.get(&key);
        }
        if self.failed.contains_key(&key) {
            return None;
        }

        if let Some(pos) = self.stopping.iter().position(|r| r.path() == key) {
            if !self.stopping[pos].has_stopped() {
                trace!("Reader for {} still stopping, request skipped", key.display());
                return None;
            }
            debug!("Reaped reader: {}", key.display());
            self.stopping.swap_remove(pos);
        }

        match Reader::open(&key, Arc::clone(&self.backend), self.options.clone()) {
            Ok(reader) => {
                self.opened += 1;
                Some(&*self.live.entry(key).or_insert(reader))
            }
            Err(e) => {
                warn!("Cannot open {}: {}", key.display(), e);
                self.failed.insert(key, e.to_string());
                None
            }
        }
    }

    pub fn reader(&self, path: &Path) -> Option<&Reader> {
        self.live.get(&canonical_path(path))
    }

    pub fn set_active_ranges(&mut self, ranges: Vec<TimeRange>) {
        debug!("Active ranges: {}", ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", "));
        self.active = Some(ranges);
    }

    /// Whether any clip using `key` overlaps an active range
    fn is_needed(&self, key: &Path) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        self.usage
            .get(key)
            .is_some_and(|ranges| ranges.iter().any(|u| active.iter().any(|a| u.intersects(a))))
    }

    /// Stop idle readers that left the active ranges. Returns how many were stopped.
    pub fn stop_pass(&mut self) -> usize {
        // Readers whose workers died are replaced on next use
        let dead: Vec<PathBuf> = self
            .live
            .iter()
            .filter(|(_, reader)| reader.state() != ReaderState::Active)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            if let Some(reader) = self.live.shift_remove(key) {
                warn!("Reader for {} wound down on its own, will reopen on demand", key.display());
                self.stopping.push(reader);
            }
        }

        if self.active.is_none() {
            return 0;
        }
        let retire: Vec<PathBuf> = self
            .live
            .iter()
            .filter(|(key, reader)| reader.pending() == 0 && !self.is_needed(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &retire {
            if let Some(reader) = self.live.shift_remove(key) {
                info!("Retiring reader: {}", key.display());
                reader.stop();
                self.stopping.push(reader);
            }
        }
        self.retired += retire.len();
        retire.len()
    }

    /// Drop stopping readers whose threads have exited. Returns how many were dropped.
    pub fn reap_pass(&mut self) -> usize {
        if self.stopping.is_empty() {
            return 0;
        }
        let (done, still): (Vec<Reader>, Vec<Reader>) =
            std::mem::take(&mut self.stopping).into_iter().partition(|r| r.has_stopped());
        self.stopping = still;
        let count = done.len();
        for reader in done {
            debug!("Reaped reader: {}", reader.path().display());
        }
        count
    }

    /// Cancel queued work on every live reader
    pub fn cancel_all(&self) -> usize {
        self.live.values().map(|r| r.cancel_all()).sum()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn stopping_count(&self) -> usize {
        self.stopping.len()
    }

    /// Readers opened since the pool was created
    pub fn opened_count(&self) -> usize {
        self.opened
    }

    pub fn retired_count(&self) -> usize {
        self.retired
    }

    pub fn pending_total(&self) -> usize {
        self.live.values().map(|r| r.pending()).sum()
    }

    /// Stop everything and wait for the threads (blocking; shutdown only)
    pub fn shutdown(&mut self) {
        let live = self.live.len();
        for (_, reader) in self.live.drain(..) {
            reader.stop();
            self.stopping.push(reader);
        }
        let stopping = self.stopping.len();
        self.stopping.clear();
        debug!("Reader pool shut down ({} live, {} stopping)", live, stopping - live);
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::promise::Ticket;
    use crate::decode::testing::{MediaScript, ScriptStats, ScriptedBackend};
    use crate::entities::VideoFrame;
    use crate::time::RationalTime;
    use std::time::{Duration, Instant};

    fn options() -> ReaderOptions {
        ReaderOptions {
            queue_wait: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn range(start: f64, count: f64) -> TimeRange {
        TimeRange::from_units(start, count, 24.0)
    }

    fn usage(entries: &[(&str, TimeRange)]) -> IndexMap<PathBuf, Vec<TimeRange>> {
        let mut map: IndexMap<PathBuf, Vec<TimeRange>> = IndexMap::new();
        for (path, r) in entries {
            map.entry(PathBuf::from(path)).or_default().push(*r);
        }
        map
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_one_reader_per_file() {
        let backend = ScriptedBackend::new();
        let stats = backend.stats();
        let mut pool = ReaderPool::new(Arc::new(backend), options(), usage(&[("foo.mov", range(0.0, 10.0))]));

        assert!(pool.get_or_open(Path::new("foo.mov")).is_some());
        assert!(pool.get_or_open(Path::new("foo.mov")).is_some());
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.opened_count(), 1);
        assert_eq!(ScriptStats::get(&stats.probes), 1);
    }

    #[test]
    fn test_probe_failure_remembered() {
        let backend = ScriptedBackend::new().with_media(
            "bad.mov",
            MediaScript {
                fail_probe: true,
                ..Default::default()
            },
        );
        let stats = backend.stats();
        let mut pool = ReaderPool::new(Arc::new(backend), options(), IndexMap::new());
        assert!(pool.get_or_open(Path::new("bad.mov")).is_none());
        assert!(pool.get_or_open(Path::new("bad.mov")).is_none());
        assert_eq!(ScriptStats::get(&stats.probes), 1);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_unset_active_ranges_retire_nothing() {
        let mut pool = ReaderPool::new(
            Arc::new(ScriptedBackend::new()),
            options(),
            usage(&[("a.mov", range(0.0, 10.0))]),
        );
        pool.get_or_open(Path::new("a.mov"));
        assert_eq!(pool.stop_pass(), 0);
        assert_eq!(pool.live_count(), 1);

        // Set, even to nothing, enables retirement
        pool.set_active_ranges(Vec::new());
        assert_eq!(pool.stop_pass(), 1);
        assert_eq!(pool.live_count(), 0);
        assert!(wait_until(|| pool.reap_pass() == 1 || pool.stopping_count() == 0));
        assert_eq!(pool.stopping_count(), 0);
    }

    /// Test: out-of-range reader with queued work
    /// Validates: it stays live until its requests complete, then is stopped and reaped
    #[test]
    fn test_pending_work_blocks_retirement() {
        let backend = ScriptedBackend::new().with_media(
            "slow.mov",
            MediaScript {
                decode_delay: Duration::from_millis(40),
                ..Default::default()
            },
        );
        let mut pool = ReaderPool::new(Arc::new(backend), options(), usage(&[("slow.mov", range(0.0, 100.0))]));
        let tickets: Vec<Ticket<VideoFrame>> = {
            let reader = pool.get_or_open(Path::new("slow.mov")).unwrap();
            (0..3).map(|f| reader.request_video(RationalTime::new(f as f64 * 30.0, 24.0))).collect()
        };

        pool.set_active_ranges(vec![range(500.0, 10.0)]);
        assert_eq!(pool.stop_pass(), 0);
        assert_eq!(pool.live_count(), 1);

        for ticket in tickets {
            assert!(ticket.wait().is_some());
        }
        assert!(wait_until(|| pool.pending_total() == 0));
        assert_eq!(pool.stop_pass(), 1);
        assert!(wait_until(|| {
            pool.reap_pass();
            pool.stopping_count() == 0
        }));
        assert_eq!(pool.retired_count(), 1);
    }

    #[test]
    fn test_in_range_reader_kept() {
        let mut pool = ReaderPool::new(
            Arc::new(ScriptedBackend::new()),
            options(),
            usage(&[("a.mov", range(0.0, 10.0)), ("b.mov", range(10.0, 10.0))]),
        );
        pool.get_or_open(Path::new("a.mov"));
        pool.get_or_open(Path::new("b.mov"));
        // Half-open: [10, 20) does not touch [0, 10)
        pool.set_active_ranges(vec![range(10.0, 2.0)]);
        assert_eq!(pool.stop_pass(), 1);
        assert!(pool.reader(Path::new("b.mov")).is_some());
        assert!(pool.reader(Path::new("a.mov")).is_none());
    }

    /// Test: file needed again while its retired reader is mid-decode
    /// Validates: the tick is not held up by a join, the file never has two
    /// readers, and it reopens once the old threads have exited
    #[test]
    fn test_reopen_while_stopping_does_not_block() {
        let backend = ScriptedBackend::new().with_media(
            "slow.mov",
            MediaScript {
                decode_delay: Duration::from_millis(300),
                ..Default::default()
            },
        );
        let stats = backend.stats();
        let mut pool = ReaderPool::new(Arc::new(backend), options(), usage(&[("slow.mov", range(0.0, 10.0))]));
        let ticket = pool
            .get_or_open(Path::new("slow.mov"))
            .unwrap()
            .request_video(RationalTime::new(0.0, 24.0));
        assert!(ticket.wait().is_some());
        // Worker is now prefetching frame 1
        std::thread::sleep(Duration::from_millis(20));

        pool.set_active_ranges(Vec::new());
        assert_eq!(pool.stop_pass(), 1);
        pool.set_active_ranges(vec![range(0.0, 5.0)]);

        let started = Instant::now();
        assert!(pool.get_or_open(Path::new("slow.mov")).is_none());
        assert!(started.elapsed() < Duration::from_millis(50), "blocked for {:?}", started.elapsed());
        assert_eq!(pool.live_count() + pool.stopping_count(), 1);

        assert!(wait_until(|| {
            pool.reap_pass();
            pool.get_or_open(Path::new("slow.mov")).is_some()
        }));
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.stopping_count(), 0);
        assert_eq!(ScriptStats::get(&stats.probes), 2);
    }

    /// Test: a reader whose decode thread panicked
    /// Validates: the next stop pass moves it out of the live set, even with
    /// active ranges unset, and the next use opens a fresh reader
    #[test]
    fn test_dead_reader_replaced() {
        let backend = ScriptedBackend::new().with_media(
            "crash.mov",
            MediaScript {
                panic_at: Some(2),
                decode_delay: Duration::from_millis(5),
                ..Default::default()
            },
        );
        let mut pool = ReaderPool::new(Arc::new(backend), options(), usage(&[("crash.mov", range(0.0, 100.0))]));
        let ticket = pool
            .get_or_open(Path::new("crash.mov"))
            .unwrap()
            .request_video(RationalTime::new(2.0, 24.0));
        assert!(ticket.wait().is_none());
        assert!(wait_until(|| pool.reader(Path::new("crash.mov")).is_some_and(|r| r.has_stopped())));

        assert_eq!(pool.stop_pass(), 0);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.reap_pass(), 1);

        let reader = pool.get_or_open(Path::new("crash.mov")).unwrap();
        assert!(reader.request_video(RationalTime::new(0.0, 24.0)).wait().is_some());
        assert_eq!(pool.opened_count(), 2);
    }

    /// Minimal LCG so the property test is reproducible without extra crates
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    /// Test: random toggling of active ranges while readers serve requests
    /// Validates: after each stop pass no idle out-of-range reader remains live,
    /// and no needed reader was retired
    #[test]
    fn test_retirement_property_random_ranges() {
        let files = [
            ("r0.mov", range(0.0, 100.0)),
            ("r1.mov", range(100.0, 100.0)),
            ("r2.mov", range(50.0, 100.0)),
            ("r3.mov", range(300.0, 50.0)),
        ];
        let mut pool = ReaderPool::new(Arc::new(ScriptedBackend::new()), options(), usage(&files));
        let mut rng = Lcg(0x5eed);

        for _ in 0..40 {
            let active: Vec<TimeRange> = (0..rng.below(3))
                .map(|_| range(rng.below(400) as f64, (1 + rng.below(80)) as f64))
                .collect();
            pool.set_active_ranges(active.clone());
            let needed = |r: &TimeRange| active.iter().any(|a| a.intersects(r));

            // Touch the files the viewer needs, like the player would
            let mut tickets = Vec::new();
            for (path, r) in &files {
                if needed(r) {
                    // A reader retired last round must exit before the file reopens
                    assert!(wait_until(|| {
                        pool.reap_pass();
                        pool.get_or_open(Path::new(path)).is_some()
                    }));
                    let reader = pool.reader(Path::new(path)).unwrap();
                    tickets.push(reader.request_video(RationalTime::new(rng.below(100) as f64, 24.0)));
                }
            }
            for ticket in tickets {
                ticket.wait();
            }
            assert!(wait_until(|| pool.pending_total() == 0));

            pool.stop_pass();
            for (path, r) in &files {
                let live = pool.reader(Path::new(path)).is_some();
                assert_eq!(live, needed(r), "{path} live={live} with active {:?}", active);
            }
            pool.reap_pass();
            assert!(pool.live_count() <= files.len());
        }
    }
}
