//! Resolves what is "current" at a playback position.

use serde::Serialize;

use crate::sampler::sample_timestamps;
use crate::timeline::{EmotionTimeline, EyeContactTimeline};
use crate::Result;

/// The derived state at one playback position.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlaybackState {
    pub current_time: f64,
    pub current_emotion: Option<String>,
    pub current_eye_contact: bool,
}

/// Pure query over two finished timelines.
///
/// The synchronizer owns no mutable state; callers poll [PlaybackSynchronizer::resolve] at
/// whatever cadence suits them.
#[derive(Clone, Debug)]
pub struct PlaybackSynchronizer {
    emotions: EmotionTimeline,
    eye_contact: EyeContactTimeline,
    window: f64,
}

impl PlaybackSynchronizer {
    pub fn new(emotions: EmotionTimeline, eye_contact: EyeContactTimeline) -> Self {
        Self {
            emotions,
            eye_contact,
            window: crate::DEFAULT_EYE_CONTACT_WINDOW,
        }
    }

    /// Returns a new [PlaybackSynchronizer] with the provided eye-contact `window` (seconds).
    pub fn with_window(mut self, window: f64) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    pub fn emotions(&self) -> &EmotionTimeline {
        &self.emotions
    }

    pub fn eye_contact(&self) -> &EyeContactTimeline {
        &self.eye_contact
    }

    /// Resolves the state at `current_time`.
    ///
    /// The emotion is the label of the latest event at or before `current_time` (the last
    /// emitted one on ties), or `None` if there is no such event. Eye contact is true iff a
    /// detection lies strictly within the window of `current_time`.
    pub fn resolve(&self, current_time: f64) -> PlaybackState {
        PlaybackState {
            current_time,
            current_emotion: self
                .emotions
                .latest_at(current_time)
                .map(|e| e.label().to_string()),
            current_eye_contact: self.eye_contact.contains_near(current_time, self.window),
        }
    }

    /// Resolves the state at every `cadence` tick over `[0, duration)`, the way a player
    /// polling on a fixed timer would see it.
    pub fn poll(
        &self,
        duration: f64,
        cadence: f64,
    ) -> Result<impl Iterator<Item = PlaybackState> + '_> {
        let schedule = sample_timestamps(duration, cadence)?;
        Ok(schedule.map(move |t| self.resolve(t)))
    }
}
