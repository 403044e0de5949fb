//! Interval math: timestamp → (family, slot).
//!
//! A family is a rollup bucket (one hour by default); a slot is the
//! position of a point inside its family at the configured interval. The
//! memory database stores one fixed-width slot buffer per (series, field,
//! family), so the calculator is the only place that decides where a point
//! lands.

use crate::error::{Error, Result};

/// Maps timestamps to family start times and slot indexes.
///
/// `family_ms` must be a non-zero multiple of `interval_ms`; the quotient is
/// the time window, the fixed slot count of every segment buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalCalc {
    interval_ms: i64,
    family_ms: i64,
}

pub const DEFAULT_INTERVAL_MS: i64 = 10_000;
pub const DEFAULT_FAMILY_MS: i64 = 3_600_000;

impl IntervalCalc {
    pub fn new(interval_ms: i64, family_ms: i64) -> Result<IntervalCalc> {
        if interval_ms <= 0 || family_ms <= 0 {
            return Err(Error::InvalidInterval(format!(
                "interval {interval_ms}ms / family {family_ms}ms must be positive"
            )));
        }
        if family_ms % interval_ms != 0 {
            return Err(Error::InvalidInterval(format!(
                "family {family_ms}ms is not a multiple of interval {interval_ms}ms"
            )));
        }
        Ok(IntervalCalc {
            interval_ms,
            family_ms,
        })
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Slot count per family.
    pub fn time_window(&self) -> u16 {
        (self.family_ms / self.interval_ms) as u16
    }

    /// Start timestamp of the family containing `timestamp`.
    pub fn family_time(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.family_ms) * self.family_ms
    }

    /// Slot of `timestamp` inside the family starting at `family_time`.
    /// Guaranteed in `[0, time_window)` when `family_time` came from
    /// [`IntervalCalc::family_time`] for the same timestamp.
    pub fn slot_of(&self, timestamp: i64, family_time: i64) -> u16 {
        ((timestamp - family_time) / self.interval_ms) as u16
    }

    /// Inverse of `slot_of`: the point timestamp a (family, slot) stands for.
    pub fn point_time(&self, family_time: i64, slot: u16) -> i64 {
        family_time + self.interval_ms * slot as i64
    }
}

impl Default for IntervalCalc {
    fn default() -> Self {
        IntervalCalc {
            interval_ms: DEFAULT_INTERVAL_MS,
            family_ms: DEFAULT_FAMILY_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window_is_one_hour_of_ten_second_slots() {
        let calc = IntervalCalc::default();
        assert_eq!(calc.time_window(), 360);
    }

    #[test]
    fn test_family_alignment() {
        let calc = IntervalCalc::default();
        // 2019-07-02 19:10:48 UTC
        let ts = 1_562_094_648_000;
        let family = calc.family_time(ts);
        // 2019-07-02 19:00:00 UTC
        assert_eq!(family, 1_562_094_000_000);
        assert_eq!(calc.slot_of(ts, family), 64);
        assert!(calc.slot_of(ts, family) < calc.time_window());
    }

    #[test]
    fn test_point_time_inverts_slot() {
        let calc = IntervalCalc::new(10_000, 3_600_000).unwrap();
        let family = calc.family_time(1_562_094_648_000);
        let slot = calc.slot_of(1_562_094_648_000, family);
        // point_time lands on the slot boundary at or before the raw timestamp
        assert_eq!(calc.point_time(family, slot), 1_562_094_640_000);
    }

    #[test]
    fn test_negative_timestamps_align_down() {
        let calc = IntervalCalc::default();
        let family = calc.family_time(-1);
        assert_eq!(family, -3_600_000);
        assert_eq!(calc.slot_of(-1, family), 359);
    }

    #[test]
    fn test_rejects_bad_intervals() {
        assert!(IntervalCalc::new(0, 3_600_000).is_err());
        assert!(IntervalCalc::new(10_000, 0).is_err());
        assert!(IntervalCalc::new(7_000, 3_600_000).is_err());
    }
}
