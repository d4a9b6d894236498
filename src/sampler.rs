//! Timestamp schedules used to sample a media file at a fixed cadence.

use crate::{Error, Result};

/// Builds the schedule `0, interval, 2 * interval, ...` covering `[0, duration)`.
///
/// A zero `duration` is valid and yields an empty schedule.
pub fn sample_timestamps(duration: f64, interval: f64) -> Result<SampleSchedule> {
    if !interval.is_finite() || interval <= 0.0 {
        return Err(Error::InvalidInterval(interval));
    }
    if !duration.is_finite() || duration < 0.0 {
        return Err(Error::InvalidDuration(duration));
    }

    Ok(SampleSchedule {
        duration,
        interval,
        next: 0,
    })
}

/// A finite, strictly increasing sequence of sample timestamps (seconds).
///
/// The schedule is a pure function of its inputs, so cloning it restarts the sequence.
#[derive(Clone, Debug)]
pub struct SampleSchedule {
    duration: f64,
    interval: f64,
    next: usize,
}

impl SampleSchedule {
    #[inline]
    fn at(&self, idx: usize) -> f64 {
        // Multiply instead of accumulating so that rounding error does not drift.
        idx as f64 * self.interval
    }

    /// Total number of timestamps in the schedule.
    pub fn count_total(&self) -> usize {
        if self.duration == 0.0 {
            return 0;
        }
        let mut n = (self.duration / self.interval).ceil() as usize;
        // Correct for rounding so that the half-open `[0, duration)` convention holds exactly.
        while n > 0 && self.at(n - 1) >= self.duration {
            n -= 1;
        }
        while self.at(n) < self.duration {
            n += 1;
        }
        n
    }

    /// The final timestamp of the schedule, which marks the end of an analysis pass.
    pub fn last_timestamp(&self) -> Option<f64> {
        self.count_total().checked_sub(1).map(|idx| self.at(idx))
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }
}

impl Iterator for SampleSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let t = self.at(self.next);
        if t >= self.duration {
            return None;
        }
        self.next += 1;
        Some(t)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count_total().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SampleSchedule {}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_zero_duration_is_empty() {
        let schedule = sample_timestamps(0.0, 0.1).unwrap();
        assert_eq!(schedule.count_total(), 0);
        assert_eq!(schedule.last_timestamp(), None);
        assert_eq!(schedule.count(), 0);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            sample_timestamps(1.0, 0.0),
            Err(Error::InvalidInterval(_))
        ));
        assert!(matches!(
            sample_timestamps(1.0, -0.5),
            Err(Error::InvalidInterval(_))
        ));
        assert!(matches!(
            sample_timestamps(-1.0, 0.5),
            Err(Error::InvalidDuration(_))
        ));
        assert!(matches!(
            sample_timestamps(f64::NAN, 0.5),
            Err(Error::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_half_open_schedule() {
        let times: Vec<f64> = sample_timestamps(2.0, 0.5).unwrap().collect();
        insta::assert_debug_snapshot!(times, @r###"
        [
            0.0,
            0.5,
            1.0,
            1.5,
        ]
        "###);
    }

    #[test]
    fn test_partial_last_interval() {
        let schedule = sample_timestamps(1.2, 0.5).unwrap();
        assert_eq!(schedule.count_total(), 3);
        assert_eq!(schedule.last_timestamp(), Some(1.0));
    }

    #[test]
    fn test_schedule_is_restartable() {
        let schedule = sample_timestamps(3.0, 0.1).unwrap();
        let first: Vec<f64> = schedule.clone().collect();
        let second: Vec<f64> = schedule.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 30);
    }

    proptest! {
        #[test]
        fn prop_schedule_covers_duration(duration in 0.0f64..120.0, interval in 0.01f64..5.0) {
            let schedule = sample_timestamps(duration, interval).unwrap();
            let expected = schedule.count_total();
            let last = schedule.last_timestamp();
            let times: Vec<f64> = schedule.collect();

            prop_assert_eq!(times.len(), expected);
            prop_assert_eq!(times.last().copied(), last);
            prop_assert!(times.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(times.iter().all(|t| *t >= 0.0 && *t < duration));
            if duration > 0.0 {
                prop_assert_eq!(times[0], 0.0);
                // The next step would leave the half-open range.
                prop_assert!(times.len() as f64 * interval >= duration);
            }
        }
    }
}
