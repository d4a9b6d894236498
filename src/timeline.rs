//! Timelines produced by one analysis pass over one media source.

use serde::Serialize;

use crate::{Error, Result};

/// A value observed at a point in the media, in seconds from the start.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimestampedEvent<T> {
    value: T,
    time: f64,
}

impl<T> TimestampedEvent<T> {
    pub fn new(value: T, time: f64) -> Result<Self> {
        // Written this way so that NaN is rejected too.
        if !(time >= 0.0) {
            return Err(Error::NegativeTimestamp(time));
        }
        Ok(Self { value, time })
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn time(&self) -> f64 {
        self.time
    }
}

/// A classified emotion label and the start time of the audio segment it came from.
pub type EmotionEvent = TimestampedEvent<String>;

impl EmotionEvent {
    pub fn label(&self) -> &str {
        &self.value
    }
}

/// Append-only sequence of emotion events, kept in chronological order.
///
/// Events sharing a timestamp keep their emission order. Gaps are valid: a segment
/// without a classification simply has no event.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EmotionTimeline {
    events: Vec<EmotionEvent>,
}

impl EmotionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: impl IntoIterator<Item = EmotionEvent>) -> Self {
        let mut timeline = Self::new();
        timeline.extend(events);
        timeline
    }

    /// Appends an event. Events arrive in order from the classifier, so this is
    /// normally a push; a late event is inserted after every event not newer than it.
    pub fn push(&mut self, event: EmotionEvent) {
        match self.events.last() {
            Some(last) if last.time > event.time => {
                let idx = self.events.partition_point(|e| e.time <= event.time);
                self.events.insert(idx, event);
            }
            _ => self.events.push(event),
        }
    }

    /// Returns the most recent event not newer than `time`, if any.
    ///
    /// This is a binary search that matches a linear "last event with `event.time <= time`"
    /// scan, including the tie-break: among events with the same time the last emitted wins.
    pub fn latest_at(&self, time: f64) -> Option<&EmotionEvent> {
        let idx = self.events.partition_point(|e| e.time <= time);
        idx.checked_sub(1).map(|i| &self.events[i])
    }

    pub fn events(&self) -> &[EmotionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Extend<EmotionEvent> for EmotionTimeline {
    fn extend<I: IntoIterator<Item = EmotionEvent>>(&mut self, iter: I) {
        for event in iter {
            self.push(event);
        }
    }
}

/// Set of timestamps (seconds) at which eye contact was detected.
///
/// Frame workers complete in any order, so timestamps are sorted and de-duplicated on
/// construction. Only membership and proximity matter to consumers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EyeContactTimeline {
    timestamps: Vec<f64>,
}

impl EyeContactTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_timestamps(timestamps: impl IntoIterator<Item = f64>) -> Self {
        let mut timestamps: Vec<f64> = timestamps.into_iter().filter(|t| *t >= 0.0).collect();
        timestamps.sort_by(f64::total_cmp);
        timestamps.dedup();
        Self { timestamps }
    }

    /// Returns true if some detection lies strictly within `window` seconds of `time`.
    pub fn contains_near(&self, time: f64, window: f64) -> bool {
        // Only the two detections surrounding `time` can be the nearest one.
        let idx = self.timestamps.partition_point(|t| *t < time);
        let after = self.timestamps.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.timestamps.get(i));
        after
            .into_iter()
            .chain(before)
            .any(|t| (t - time).abs() < window)
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
