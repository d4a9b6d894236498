use tokio_util::sync::CancellationToken;

use super::{AudioSegment, SegmentSource, SoundClassifier};
use crate::timeline::{EmotionEvent, EmotionTimeline};
use crate::{Error, Result};

/// Receives emotion events in the order they are classified.
pub trait EmotionSink {
    fn on_emotion_event(&mut self, event: EmotionEvent) -> Result<()>;
}

impl EmotionSink for EmotionTimeline {
    fn on_emotion_event(&mut self, event: EmotionEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }
}

impl EmotionSink for Vec<EmotionEvent> {
    fn on_emotion_event(&mut self, event: EmotionEvent) -> Result<()> {
        self.push(event);
        Ok(())
    }
}

/// Forwards events to an async consumer. A closed channel means nobody is listening
/// anymore, which stops the scan.
impl EmotionSink for tokio::sync::mpsc::UnboundedSender<EmotionEvent> {
    fn on_emotion_event(&mut self, event: EmotionEvent) -> Result<()> {
        self.send(event).map_err(|_| Error::Cancelled)
    }
}

/// Builds an emotion timeline from a single sequential scan over an audio track.
///
/// Each segment is handed to the classifier and its top-ranked label is forwarded to the
/// sink, stamped with the segment's start time. Labels are passed through as-is; there is
/// no smoothing across segments.
#[derive(Debug)]
pub struct EmotionAnalyzer<C: SoundClassifier> {
    classifier: C,
}

impl<C: SoundClassifier> EmotionAnalyzer<C> {
    pub fn new(classifier: C) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    // Returns the event for the top-ranked label, if the classifier produced one.
    fn classify(&mut self, segment: &AudioSegment) -> Result<Option<EmotionEvent>> {
        let ranked = self.classifier.classify(segment)?;
        match ranked.into_iter().next() {
            Some(top) => {
                tracing::trace!(
                    label = %top.label,
                    confidence = top.confidence,
                    start = segment.start,
                    "classified segment"
                );
                Ok(Some(EmotionEvent::new(top.label, segment.start)?))
            }
            None => Ok(None),
        }
    }

    /// Scans `source` to completion, forwarding each classification to `sink`.
    ///
    /// Returns the number of events emitted. Returning is the "analysis complete" signal.
    /// A segment the classifier fails on is logged and skipped. The scan stops with
    /// [Error::Cancelled] as soon as `cancel` fires.
    pub fn run(
        &mut self,
        source: &mut dyn SegmentSource,
        sink: &mut dyn EmotionSink,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let span = tracing::span!(tracing::Level::TRACE, "emotion");
        let _enter = span.enter();

        let mut emitted = 0;
        let mut skipped = 0;

        source.scan(&mut |segment| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.classify(&segment) {
                Ok(Some(event)) => {
                    sink.on_emotion_event(event)?;
                    emitted += 1;
                }
                Ok(None) => (),
                Err(e) => {
                    tracing::warn!(start = segment.start, "skipping audio segment: {}", e);
                    skipped += 1;
                }
            }
            Ok(())
        })?;

        tracing::debug!(emitted, skipped, "emotion analysis complete");

        Ok(emitted)
    }
}
