//! Transitions between adjacent clips.
//!
//! A transition sits between two clips on a track and occupies no track time.
//! Its window straddles the cut: `in_offset` units before it (tail of the
//! outgoing clip) and `out_offset` units after it (head of the incoming clip).
//!
//! # Blend factor
//!
//! Progress through the window is `(t - window_start) / (in_offset + out_offset + 1)`,
//! clamped to `[0, 1]`. The layer of the outgoing clip carries the incoming clip
//! as its B image with factor `progress`; the layer of the incoming clip carries
//! the outgoing clip with factor `1 - progress`. Either way the factor is the
//! weight of the B image, so 0 means "pure primary image".

use serde::{Deserialize, Serialize};

use crate::time::{RationalTime, TimeRange};

/// Blend kinds understood by the renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    #[default]
    None,
    Dissolve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub name: String,
    pub kind: TransitionKind,
    /// Units before the cut (timeline rate)
    pub in_offset: RationalTime,
    /// Units after the cut (timeline rate)
    pub out_offset: RationalTime,
}

impl Transition {
    pub fn dissolve(in_offset: RationalTime, out_offset: RationalTime) -> Self {
        Self {
            name: String::new(),
            kind: TransitionKind::Dissolve,
            in_offset,
            out_offset,
        }
    }

    /// Whether the renderer has anything to blend
    pub fn blends(&self) -> bool {
        self.kind != TransitionKind::None
    }

    /// Overlap window around the cut at `cut` (half-open)
    pub fn window(&self, cut: RationalTime) -> TimeRange {
        let start = cut - self.in_offset;
        let end = cut + self.out_offset;
        TimeRange::from_start_end(start, end)
    }

    /// Progress through the window at timeline time `time`, in `[0, 1]`
    pub fn progress(&self, time: RationalTime, cut: RationalTime) -> f32 {
        let rate = time.rate;
        let in_units = self.in_offset.value_rescaled_to(rate);
        let out_units = self.out_offset.value_rescaled_to(rate);
        let window_start = cut.value_rescaled_to(rate) - in_units;
        let span = in_units + out_units + 1.0;
        if span <= 0.0 {
            return 0.0;
        }
        (((time.value - window_start) / span) as f32).clamp(0.0, 1.0)
    }

    /// B-image weight for the layer of the clip leaving at `cut`
    pub fn outgoing_value(&self, time: RationalTime, cut: RationalTime) -> f32 {
        self.progress(time, cut)
    }

    /// B-image weight for the layer of the clip entering at `cut`
    pub fn incoming_value(&self, time: RationalTime, cut: RationalTime) -> f32 {
        1.0 - self.progress(time, cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dissolve(i: f64, o: f64) -> Transition {
        Transition::dissolve(RationalTime::new(i, 24.0), RationalTime::new(o, 24.0))
    }

    /// Test: six frames into a 12/12 dissolve ending at 100
    /// Validates: factor = 6 / 25
    #[test]
    fn test_dissolve_example_value() {
        let tr = dissolve(12.0, 12.0);
        let cut = RationalTime::new(100.0, 24.0);
        let value = tr.outgoing_value(RationalTime::new(94.0, 24.0), cut);
        assert!((value - 0.24).abs() < 1e-6);
    }

    /// Test: factor stays in [0, 1] and is monotonic across the window
    #[test]
    fn test_blend_bounds_and_monotonic() {
        for (i, o) in [(12.0, 12.0), (0.0, 5.0), (7.0, 0.0), (1.0, 30.0)] {
            let tr = dissolve(i, o);
            let cut = RationalTime::new(200.0, 24.0);
            let window = tr.window(cut);

            let mut prev_out = -1.0f32;
            let mut prev_in = 2.0f32;
            let mut t = window.start_time.value - 3.0;
            while t < window.end_time_exclusive().value + 3.0 {
                let time = RationalTime::new(t, 24.0);
                let out_v = tr.outgoing_value(time, cut);
                let in_v = tr.incoming_value(time, cut);
                assert!((0.0..=1.0).contains(&out_v), "out of range at {t}");
                assert!((0.0..=1.0).contains(&in_v), "out of range at {t}");
                assert!(out_v >= prev_out);
                assert!(in_v <= prev_in);
                prev_out = out_v;
                prev_in = in_v;
                t += 0.5;
            }

            let start = window.start_time;
            assert_eq!(tr.outgoing_value(start, cut), 0.0);
            let at_end = tr.outgoing_value(window.end_time_exclusive(), cut);
            assert!((at_end - ((i + o) / (i + o + 1.0)) as f32).abs() < 1e-6);
        }
    }

    #[test]
    fn test_window_straddles_cut() {
        let tr = dissolve(12.0, 6.0);
        let w = tr.window(RationalTime::new(100.0, 24.0));
        assert_eq!(w.start_time.value, 88.0);
        assert_eq!(w.end_time_exclusive().value, 106.0);
    }

    #[test]
    fn test_offsets_at_other_rate() {
        // Half a second in/out at 24 fps expressed in seconds
        let tr = Transition::dissolve(RationalTime::new(0.5, 1.0), RationalTime::new(0.5, 1.0));
        let cut = RationalTime::new(48.0, 24.0);
        assert_eq!(tr.outgoing_value(RationalTime::new(36.0, 24.0), cut), 0.0);
        assert!((tr.outgoing_value(RationalTime::new(41.0, 24.0), cut) - 5.0 / 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&TransitionKind::Dissolve).unwrap();
        assert_eq!(json, "\"dissolve\"");
        let kind: TransitionKind = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(kind, TransitionKind::None);
    }
}
