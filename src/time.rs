//! Rational time and half-open time ranges
//!
//! A `RationalTime` is a count of units at a rate (frames at 24 fps, samples at
//! 48 kHz, ...). Conversions between rates go through seconds. Ranges are
//! half-open, `[start, start + duration)`, so two back-to-back clips never both
//! own the boundary frame.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Tolerance used when comparing times and flooring rescaled values.
///
/// Rescaling 94 frames from 24 to 48 fps and back must still floor to 94.
const EPSILON: f64 = 1e-9;

/// A point in time expressed as `value` units at `rate` units per second.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RationalTime {
    pub value: f64,
    pub rate: f64,
}

impl RationalTime {
    pub const fn new(value: f64, rate: f64) -> Self {
        Self { value, rate }
    }

    pub fn from_seconds(seconds: f64, rate: f64) -> Self {
        Self {
            value: seconds * rate,
            rate,
        }
    }

    /// Time in seconds (0 for an invalid rate)
    pub fn to_seconds(&self) -> f64 {
        if self.rate > 0.0 {
            self.value / self.rate
        } else {
            0.0
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0.0 && self.value.is_finite()
    }

    /// Same instant expressed at another rate
    pub fn rescaled_to(&self, rate: f64) -> Self {
        if self.rate == rate || self.rate <= 0.0 {
            return Self {
                value: self.value,
                rate,
            };
        }
        Self {
            value: self.value * rate / self.rate,
            rate,
        }
    }

    pub fn value_rescaled_to(&self, rate: f64) -> f64 {
        self.rescaled_to(rate).value
    }

    /// Floor to a whole unit, tolerant of rescale rounding
    pub fn floor(&self) -> Self {
        Self {
            value: (self.value + EPSILON).floor(),
            rate: self.rate,
        }
    }

    pub fn round(&self) -> Self {
        Self {
            value: self.value.round(),
            rate: self.rate,
        }
    }

    /// Whole unit index at this time's own rate
    pub fn to_units(&self) -> i64 {
        self.floor().value as i64
    }
}

impl PartialEq for RationalTime {
    fn eq(&self, other: &Self) -> bool {
        (self.to_seconds() - other.to_seconds()).abs() < EPSILON
    }
}

impl PartialOrd for RationalTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        self.to_seconds().partial_cmp(&other.to_seconds())
    }
}

impl Add for RationalTime {
    type Output = RationalTime;

    /// Result is expressed at the left-hand rate
    fn add(self, rhs: RationalTime) -> RationalTime {
        RationalTime::new(self.value + rhs.value_rescaled_to(self.rate), self.rate)
    }
}

impl Sub for RationalTime {
    type Output = RationalTime;

    fn sub(self, rhs: RationalTime) -> RationalTime {
        RationalTime::new(self.value - rhs.value_rescaled_to(self.rate), self.rate)
    }
}

impl fmt::Display for RationalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value, self.rate)
    }
}

/// Half-open range `[start_time, start_time + duration)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_time: RationalTime,
    pub duration: RationalTime,
}

impl TimeRange {
    pub const fn new(start_time: RationalTime, duration: RationalTime) -> Self {
        Self {
            start_time,
            duration,
        }
    }

    /// Range of `count` units starting at unit `start`, both at `rate`
    pub fn from_units(start: f64, count: f64, rate: f64) -> Self {
        Self::new(RationalTime::new(start, rate), RationalTime::new(count, rate))
    }

    /// Range between two times; the end is exclusive
    pub fn from_start_end(start: RationalTime, end_exclusive: RationalTime) -> Self {
        Self::new(start, end_exclusive - start)
    }

    pub fn rate(&self) -> f64 {
        self.start_time.rate
    }

    pub fn end_time_exclusive(&self) -> RationalTime {
        self.start_time + self.duration
    }

    /// Last whole unit inside the range
    pub fn end_time_inclusive(&self) -> RationalTime {
        let end = self.end_time_exclusive();
        RationalTime::new(end.value - 1.0, end.rate)
    }

    pub fn is_empty(&self) -> bool {
        self.duration.value <= 0.0
    }

    pub fn contains(&self, time: RationalTime) -> bool {
        time >= self.start_time && time < self.end_time_exclusive()
    }

    /// True when the two half-open ranges share any instant
    pub fn intersects(&self, other: &TimeRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start_time < other.end_time_exclusive() && other.start_time < self.end_time_exclusive()
    }

    /// Grow the range by `before` at the start and `after` at the end
    pub fn extended_by(&self, before: RationalTime, after: RationalTime) -> Self {
        let start = self.start_time - before;
        let end = self.end_time_exclusive() + after;
        Self::from_start_end(start, end)
    }

    /// Clamp `time` to the whole units covered by this range
    pub fn clamped(&self, time: RationalTime) -> RationalTime {
        let t = time.rescaled_to(self.rate());
        if t < self.start_time {
            self.start_time
        } else if t > self.end_time_inclusive() {
            self.end_time_inclusive()
        } else {
            t
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})@{}",
            self.start_time.value,
            self.end_time_exclusive().value,
            self.rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_roundtrip_floors_exactly() {
        let t = RationalTime::new(94.0, 24.0);
        let back = t.rescaled_to(23.976).rescaled_to(24.0);
        assert_eq!(back.floor().value, 94.0);
        assert_eq!(RationalTime::new(1.0, 24.0).rescaled_to(48.0).value, 2.0);
    }

    #[test]
    fn test_compare_across_rates() {
        assert_eq!(RationalTime::new(12.0, 24.0), RationalTime::new(0.5, 1.0));
        assert!(RationalTime::new(11.0, 24.0) < RationalTime::new(24.0, 48.0));
    }

    #[test]
    fn test_range_is_half_open() {
        let a = TimeRange::from_units(0.0, 100.0, 24.0);
        let b = TimeRange::from_units(100.0, 100.0, 24.0);
        let boundary = RationalTime::new(100.0, 24.0);

        assert!(!a.contains(boundary));
        assert!(b.contains(boundary));
        assert!(a.contains(RationalTime::new(99.0, 24.0)));
        assert!(!a.intersects(&b));
        assert_eq!(a.end_time_inclusive().value, 99.0);
    }

    #[test]
    fn test_intersects_and_extend() {
        let a = TimeRange::from_units(10.0, 5.0, 24.0);
        assert!(a.intersects(&TimeRange::from_units(14.0, 1.0, 24.0)));
        assert!(!a.intersects(&TimeRange::from_units(15.0, 10.0, 24.0)));
        assert!(!a.intersects(&TimeRange::from_units(12.0, 0.0, 24.0)));

        let grown = a.extended_by(RationalTime::new(2.0, 24.0), RationalTime::new(3.0, 24.0));
        assert_eq!(grown.start_time.value, 8.0);
        assert_eq!(grown.end_time_exclusive().value, 18.0);
    }

    #[test]
    fn test_clamped() {
        let r = TimeRange::from_units(0.0, 10.0, 24.0);
        assert_eq!(r.clamped(RationalTime::new(-4.0, 24.0)).value, 0.0);
        assert_eq!(r.clamped(RationalTime::new(42.0, 24.0)).value, 9.0);
        assert_eq!(r.clamped(RationalTime::new(10.0, 48.0)).value, 5.0);
    }
}
