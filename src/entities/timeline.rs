//! Composition graph: tracks of clips, gaps and transitions.
//!
//! # Architecture
//!
//! `Timeline` is read from an editorial JSON document and never mutated during
//! playback. Items on a track are a closed sum type (`Item`), laid out
//! back-to-back: clips and gaps take track time, transitions take none and
//! only describe how the clips on either side blend across the cut.
//!
//! # Coordinate Systems
//!
//! - timeline time: what callers pass to `Player::request_frame` (includes
//!   `global_start_time`)
//! - track time: timeline time minus `global_start_time`, at the timeline rate
//! - clip-local time: track time re-based onto the clip's `source_range`
//!
//! `TimelineLayout` precomputes every item's track range once so resolving
//! "what covers t" is a walk over plain ranges.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::transition::{Transition, TransitionKind};
use crate::error::{EngineError, EngineResult};
use crate::time::{RationalTime, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Where a clip's media lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaReference {
    pub path: PathBuf,
    /// Range of the media itself, if the document knows it
    #[serde(default)]
    pub available_range: Option<TimeRange>,
}

/// A trimmed reference into one source media
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub media: MediaReference,
    /// Trimmed range within the source, at the source's rate
    pub source_range: TimeRange,
}

impl Clip {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, source_range: TimeRange) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            media: MediaReference {
                path: path.into(),
                available_range: None,
            },
            source_range,
        }
    }

    pub fn path(&self) -> &Path {
        &self.media.path
    }

    /// Map a track time inside `range` (this clip's track range) to source time
    pub fn local_time(&self, track_time: RationalTime, range: &TimeRange) -> RationalTime {
        self.source_range.start_time + (track_time - range.start_time)
    }
}

/// Empty space on a track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub duration: RationalTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
    Clip(Clip),
    Transition(Transition),
    Gap(Gap),
}

impl Item {
    /// Track time taken by this item (transitions take none)
    pub fn duration(&self, rate: f64) -> RationalTime {
        match self {
            Item::Clip(c) => c.source_range.duration.rescaled_to(rate),
            Item::Gap(g) => g.duration.rescaled_to(rate),
            Item::Transition(_) => RationalTime::new(0.0, rate),
        }
    }

    pub fn as_clip(&self) -> Option<&Clip> {
        match self {
            Item::Clip(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_transition(&self) -> Option<&Transition> {
        match self {
            Item::Transition(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub name: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Track {
    pub fn new(name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            name: name.into(),
            kind,
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    /// Track range of every item; transitions get a zero-length range at the cut
    pub fn item_ranges(&self, rate: f64) -> Vec<TimeRange> {
        let mut cursor = RationalTime::new(0.0, rate);
        self.items
            .iter()
            .map(|item| {
                let duration = item.duration(rate);
                let range = TimeRange::new(cursor, duration);
                cursor = cursor + duration;
                range
            })
            .collect()
    }

    pub fn range_of(&self, index: usize, rate: f64) -> Option<TimeRange> {
        self.item_ranges(rate).get(index).copied()
    }

    /// Index of the clip or gap covering `track_time`
    pub fn item_at(&self, track_time: RationalTime, rate: f64) -> Option<usize> {
        self.item_ranges(rate)
            .iter()
            .zip(&self.items)
            .position(|(range, item)| !matches!(item, Item::Transition(_)) && range.contains(track_time))
    }

    /// Transitions on either side of item `index`
    pub fn neighbors(&self, index: usize) -> (Option<(&Transition, usize)>, Option<(&Transition, usize)>) {
        (self.transition_before(index), self.transition_after(index))
    }

    pub fn duration(&self, rate: f64) -> RationalTime {
        self.items
            .iter()
            .fold(RationalTime::new(0.0, rate), |acc, item| acc + item.duration(rate))
    }

    /// Transition directly before item `index`, with the clip it comes from
    pub fn transition_before(&self, index: usize) -> Option<(&Transition, usize)> {
        let t = self.items.get(index.checked_sub(1)?)?.as_transition()?;
        let prev = index.checked_sub(2)?;
        self.items.get(prev)?.as_clip()?;
        Some((t, prev))
    }

    /// Transition directly after item `index`, with the clip it leads to
    pub fn transition_after(&self, index: usize) -> Option<(&Transition, usize)> {
        let t = self.items.get(index + 1)?.as_transition()?;
        self.items.get(index + 2)?.as_clip()?;
        Some((t, index + 2))
    }
}

/// The full composition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub name: String,
    /// Timeline rate; track times and transition offsets are expressed at it
    pub rate: f64,
    #[serde(default)]
    pub global_start_time: Option<RationalTime>,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl Timeline {
    pub fn new(name: impl Into<String>, rate: f64) -> Self {
        Self {
            name: name.into(),
            rate,
            global_start_time: None,
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn global_start_time(&self) -> RationalTime {
        self.global_start_time
            .map(|t| t.rescaled_to(self.rate))
            .unwrap_or(RationalTime::new(0.0, self.rate))
    }

    /// Longest track
    pub fn duration(&self) -> RationalTime {
        self.tracks
            .iter()
            .map(|t| t.duration(self.rate))
            .fold(RationalTime::new(0.0, self.rate), |a, b| if b > a { b } else { a })
    }

    /// Timeline range in caller time (global start included)
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.global_start_time(), self.duration())
    }

    /// Parse a timeline document
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let timeline: Timeline = serde_json::from_str(json)?;
        timeline.validate()?;
        Ok(timeline)
    }

    /// Load a timeline document; relative media paths resolve against its folder
    pub fn load(path: &Path) -> EngineResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut timeline = Self::from_json(&json)?;
        if let Some(base) = path.parent() {
            timeline.resolve_media_paths(base);
        }
        Ok(timeline)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Make every relative media path absolute against `base`
    pub fn resolve_media_paths(&mut self, base: &Path) {
        for track in &mut self.tracks {
            for item in &mut track.items {
                if let Item::Clip(clip) = item {
                    if clip.media.path.is_relative() {
                        clip.media.path = base.join(&clip.media.path);
                    }
                }
            }
        }
    }

    /// Structural checks run before playback starts
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.rate > 0.0) {
            return Err(EngineError::timeline(format!("invalid timeline rate {}", self.rate)));
        }
        for (ti, track) in self.tracks.iter().enumerate() {
            for (ii, item) in track.items.iter().enumerate() {
                let at = format!("track {} ('{}') item {}", ti, track.name, ii);
                match item {
                    Item::Clip(clip) => {
                        let r = &clip.source_range;
                        if !r.start_time.is_valid() || !r.duration.is_valid() {
                            return Err(EngineError::timeline(format!("{at}: invalid source range rate")));
                        }
                        if r.duration.value < 0.0 {
                            return Err(EngineError::timeline(format!("{at}: negative clip duration")));
                        }
                    }
                    Item::Gap(gap) => {
                        if !gap.duration.is_valid() || gap.duration.value < 0.0 {
                            return Err(EngineError::timeline(format!("{at}: invalid gap duration")));
                        }
                    }
                    Item::Transition(tr) => {
                        let is_clip = |i: usize| matches!(track.items.get(i), Some(Item::Clip(_)));
                        let prev = ii.checked_sub(1).filter(|&p| is_clip(p));
                        let next = Some(ii + 1).filter(|&n| is_clip(n));
                        let (Some(prev), Some(next)) = (prev, next) else {
                            return Err(EngineError::timeline(format!(
                                "{at}: transition must sit between two clips"
                            )));
                        };
                        if !tr.in_offset.is_valid()
                            || !tr.out_offset.is_valid()
                            || tr.in_offset.value < 0.0
                            || tr.out_offset.value < 0.0
                        {
                            return Err(EngineError::timeline(format!("{at}: invalid transition offsets")));
                        }
                        let prev_len = track.items[prev].duration(self.rate);
                        let next_len = track.items[next].duration(self.rate);
                        if tr.in_offset.rescaled_to(self.rate) > prev_len
                            || tr.out_offset.rescaled_to(self.rate) > next_len
                        {
                            return Err(EngineError::timeline(format!(
                                "{at}: transition window longer than its clips"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Precompute item ranges for per-frame resolution
    pub fn layout(&self) -> TimelineLayout {
        TimelineLayout {
            rate: self.rate,
            global_start: self.global_start_time(),
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackLayout {
                    kind: t.kind,
                    ranges: t.item_ranges(self.rate),
                })
                .collect(),
        }
    }

    /// Per media path, the caller-time ranges in which that media is needed.
    ///
    /// A clip's range is widened by the dissolve windows on either side: the
    /// outgoing clip is still decoded as the B image of the incoming clip's
    /// layer, and vice versa.
    pub fn media_usage(&self) -> IndexMap<PathBuf, Vec<TimeRange>> {
        let layout = self.layout();
        let offset = self.global_start_time();
        let zero = RationalTime::new(0.0, self.rate);
        let mut usage: IndexMap<PathBuf, Vec<TimeRange>> = IndexMap::new();

        for (track, track_layout) in self.tracks.iter().zip(&layout.tracks) {
            for (index, item) in track.items.iter().enumerate() {
                let Item::Clip(clip) = item else {
                    continue;
                };
                let range = track_layout.ranges[index];
                let before = track
                    .transition_before(index)
                    .filter(|(t, _)| t.blends())
                    .map_or(zero, |(t, _)| t.in_offset.rescaled_to(self.rate));
                let after = track
                    .transition_after(index)
                    .filter(|(t, _)| t.blends())
                    .map_or(zero, |(t, _)| t.out_offset.rescaled_to(self.rate));
                let widened = range.extended_by(before, after);
                let caller = TimeRange::new(widened.start_time + offset, widened.duration);
                usage.entry(clip.media.path.clone()).or_default().push(caller);
            }
        }
        usage
    }
}

/// Neighbouring clip that blends into the primary clip at some time
#[derive(Debug, Clone, Copy)]
pub struct Blend<'a> {
    pub clip: &'a Clip,
    pub range: TimeRange,
    pub kind: TransitionKind,
    /// Weight of the neighbour's image, in `[0, 1]`
    pub value: f32,
}

/// Result of resolving one track at one time
#[derive(Debug, Clone, Copy)]
pub struct Coverage<'a> {
    pub clip: &'a Clip,
    pub range: TimeRange,
    pub blend: Option<Blend<'a>>,
}

#[derive(Debug, Clone)]
pub struct TrackLayout {
    pub kind: TrackKind,
    /// One range per item, same order as `Track::items`
    pub ranges: Vec<TimeRange>,
}

impl TrackLayout {
    /// Index of the clip whose half-open range contains `track_time`
    pub fn clip_index_at(&self, track: &Track, track_time: RationalTime) -> Option<usize> {
        self.ranges
            .iter()
            .zip(&track.items)
            .position(|(range, item)| matches!(item, Item::Clip(_)) && range.contains(track_time))
    }

    /// Resolve the clip covering `track_time` and any dissolve neighbour
    pub fn resolve<'a>(&self, track: &'a Track, track_time: RationalTime) -> Option<Coverage<'a>> {
        let index = self.clip_index_at(track, track_time)?;
        let clip = track.items[index].as_clip()?;
        let range = self.ranges[index];

        // Tail of this clip: the next clip fades in on top
        let outgoing = track.transition_after(index).and_then(|(tr, next)| {
            let cut = range.end_time_exclusive();
            let start = cut - tr.in_offset;
            if !tr.blends() || track_time < start {
                return None;
            }
            Some(Blend {
                clip: track.items[next].as_clip()?,
                range: self.ranges[next],
                kind: tr.kind,
                value: tr.outgoing_value(track_time, cut),
            })
        });

        // Head of this clip: the previous clip is still fading out
        let blend = outgoing.or_else(|| {
            track.transition_before(index).and_then(|(tr, prev)| {
                let cut = range.start_time;
                let end = cut + tr.out_offset;
                if !tr.blends() || track_time >= end {
                    return None;
                }
                Some(Blend {
                    clip: track.items[prev].as_clip()?,
                    range: self.ranges[prev],
                    kind: tr.kind,
                    value: tr.incoming_value(track_time, cut),
                })
            })
        });

        Some(Coverage { clip, range, blend })
    }
}

#[derive(Debug, Clone)]
pub struct TimelineLayout {
    pub rate: f64,
    pub global_start: RationalTime,
    pub tracks: Vec<TrackLayout>,
}

impl TimelineLayout {
    /// Caller time to track time at the timeline rate
    pub fn to_track_time(&self, time: RationalTime) -> RationalTime {
        time.rescaled_to(self.rate) - self.global_start
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn clip(path: &str, start: f64, count: f64) -> Item {
        Item::Clip(Clip::new(path, path, TimeRange::from_units(start, count, 24.0)))
    }

    /// V1 = [A 0-99, Dissolve(12, 12), B 0-99]
    pub(crate) fn dissolve_timeline() -> Timeline {
        Timeline::new("dissolve", 24.0).with_track(
            Track::new("V1", TrackKind::Video)
                .with_item(clip("a.mov", 0.0, 100.0))
                .with_item(Item::Transition(Transition::dissolve(
                    RationalTime::new(12.0, 24.0),
                    RationalTime::new(12.0, 24.0),
                )))
                .with_item(clip("b.mov", 0.0, 100.0)),
        )
    }

    fn t(v: f64) -> RationalTime {
        RationalTime::new(v, 24.0)
    }

    #[test]
    fn test_item_ranges_back_to_back() {
        let track = Track::new("V1", TrackKind::Video)
            .with_item(clip("a.mov", 10.0, 50.0))
            .with_item(Item::Gap(Gap { duration: t(5.0) }))
            .with_item(clip("b.mov", 0.0, 20.0));
        let ranges = track.item_ranges(24.0);
        assert_eq!(ranges[0].start_time.value, 0.0);
        assert_eq!(ranges[1].start_time.value, 50.0);
        assert_eq!(ranges[2].start_time.value, 55.0);
        assert_eq!(track.duration(24.0).value, 75.0);

        assert_eq!(track.item_at(t(52.0), 24.0), Some(1));
        assert_eq!(track.item_at(t(55.0), 24.0), Some(2));
        assert_eq!(track.item_at(t(75.0), 24.0), None);
        assert_eq!(track.range_of(2, 24.0).unwrap().duration.value, 20.0);
        assert!(track.range_of(3, 24.0).is_none());
    }

    #[test]
    fn test_neighbors() {
        let timeline = dissolve_timeline();
        let track = &timeline.tracks[0];
        let (before, after) = track.neighbors(0);
        assert!(before.is_none());
        assert_eq!(after.map(|(_, i)| i), Some(2));
        let (before, after) = track.neighbors(2);
        assert_eq!(before.map(|(_, i)| i), Some(0));
        assert!(after.is_none());
    }

    #[test]
    fn test_resolve_outgoing_dissolve() {
        let timeline = dissolve_timeline();
        let layout = timeline.layout();
        let track = &timeline.tracks[0];

        let cov = layout.tracks[0].resolve(track, t(94.0)).unwrap();
        assert_eq!(cov.clip.path(), Path::new("a.mov"));
        let blend = cov.blend.unwrap();
        assert_eq!(blend.clip.path(), Path::new("b.mov"));
        assert_eq!(blend.kind, TransitionKind::Dissolve);
        assert!((blend.value - 0.24).abs() < 1e-6);

        // Before the window: no blend
        let cov = layout.tracks[0].resolve(track, t(87.0)).unwrap();
        assert!(cov.blend.is_none());
    }

    #[test]
    fn test_resolve_incoming_dissolve() {
        let timeline = dissolve_timeline();
        let layout = timeline.layout();
        let track = &timeline.tracks[0];

        let cov = layout.tracks[0].resolve(track, t(100.0)).unwrap();
        assert_eq!(cov.clip.path(), Path::new("b.mov"));
        let blend = cov.blend.unwrap();
        assert_eq!(blend.clip.path(), Path::new("a.mov"));
        assert!((blend.value - (1.0 - 12.0 / 25.0)).abs() < 1e-6);

        assert!(layout.tracks[0].resolve(track, t(112.0)).unwrap().blend.is_none());
    }

    /// Test: adjacent clips without a transition never blend
    /// Validates: the boundary frame belongs to the later clip only
    #[test]
    fn test_hard_cut_boundary() {
        let timeline = Timeline::new("cut", 24.0).with_track(
            Track::new("V1", TrackKind::Video)
                .with_item(clip("a.mov", 0.0, 100.0))
                .with_item(clip("b.mov", 0.0, 100.0)),
        );
        let layout = timeline.layout();
        let track = &timeline.tracks[0];

        let at_99 = layout.tracks[0].resolve(track, t(99.0)).unwrap();
        assert_eq!(at_99.clip.path(), Path::new("a.mov"));
        let at_100 = layout.tracks[0].resolve(track, t(100.0)).unwrap();
        assert_eq!(at_100.clip.path(), Path::new("b.mov"));
        assert!(at_100.blend.is_none());
        assert!(layout.tracks[0].resolve(track, t(200.0)).is_none());
        assert!(layout.tracks[0].resolve(track, t(-1.0)).is_none());
    }

    #[test]
    fn test_local_time_rebases_onto_source() {
        let c = Clip::new("a", "a.mov", TimeRange::from_units(30.0, 10.0, 24.0));
        let range = TimeRange::from_units(100.0, 10.0, 24.0);
        assert_eq!(c.local_time(t(104.0), &range).value, 34.0);
    }

    #[test]
    fn test_media_usage_widened_by_dissolve() {
        let mut timeline = dissolve_timeline();
        timeline.global_start_time = Some(RationalTime::new(1000.0, 24.0));
        let usage = timeline.media_usage();

        let a = &usage[Path::new("a.mov")];
        assert_eq!(a[0].start_time.value, 1000.0);
        assert_eq!(a[0].end_time_exclusive().value, 1112.0);
        let b = &usage[Path::new("b.mov")];
        assert_eq!(b[0].start_time.value, 1088.0);
        assert_eq!(b[0].end_time_exclusive().value, 1200.0);
    }

    #[test]
    fn test_validate_rejects_dangling_transition() {
        let timeline = Timeline::new("bad", 24.0).with_track(
            Track::new("V1", TrackKind::Video)
                .with_item(Item::Transition(Transition::dissolve(t(2.0), t(2.0))))
                .with_item(clip("a.mov", 0.0, 10.0)),
        );
        assert!(timeline.validate().is_err());

        let long = Timeline::new("bad", 24.0).with_track(
            Track::new("V1", TrackKind::Video)
                .with_item(clip("a.mov", 0.0, 10.0))
                .with_item(Item::Transition(Transition::dissolve(t(20.0), t(2.0))))
                .with_item(clip("b.mov", 0.0, 10.0)),
        );
        assert!(long.validate().is_err());
        assert!(dissolve_timeline().validate().is_ok());
        assert!(Timeline::new("bad", 0.0).validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_and_relative_paths() {
        let json = r#"{
            "name": "edit",
            "rate": 24.0,
            "tracks": [{
                "name": "V1",
                "kind": "video",
                "items": [
                    {"type": "clip", "name": "A",
                     "media": {"path": "media/a.mov"},
                     "source_range": {"start_time": {"value": 0, "rate": 24},
                                      "duration": {"value": 48, "rate": 24}}},
                    {"type": "gap", "duration": {"value": 12, "rate": 24}}
                ]
            }]
        }"#;
        let mut timeline = Timeline::from_json(json).unwrap();
        assert_eq!(timeline.duration().value, 60.0);
        timeline.resolve_media_paths(Path::new("/projects/edit"));
        let clip = timeline.tracks[0].items[0].as_clip().unwrap();
        assert_eq!(clip.path(), Path::new("/projects/edit/media/a.mov"));

        let again = Timeline::from_json(&timeline.to_json().unwrap()).unwrap();
        assert_eq!(again.tracks[0].items.len(), 2);
    }
}
