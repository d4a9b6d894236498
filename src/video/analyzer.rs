use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{frame_has_eye_contact, FrameExtractor, GazeThresholds, LandmarkDetector};
use crate::sampler::sample_timestamps;
use crate::timeline::EyeContactTimeline;
use crate::{Error, Result};

/// Builds an [EyeContactTimeline] by sampling frames from a video.
///
/// At a high-level, the analyzer does the following:
///
/// 1. Builds the schedule of sample timestamps from the video duration
/// 2. Extracts each frame and runs the landmark detector on it, with at most
///    `max_concurrent_frames` frames in flight at any time
/// 3. Judges each frame with the eye-contact heuristic and keeps the positive timestamps
///
/// Failures on a single frame (extraction, detection, or timeout) are logged and the frame
/// is treated as having no detection. Only cancellation aborts a run.
#[derive(Clone)]
pub struct EyeContactAnalyzer {
    extractor: Arc<dyn FrameExtractor>,
    detector: Arc<dyn LandmarkDetector>,
    thresholds: GazeThresholds,
    interval: f64,
    max_concurrent_frames: usize,
    frame_timeout: Option<Duration>,
}

impl std::fmt::Debug for EyeContactAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EyeContactAnalyzer")
            .field("thresholds", &self.thresholds)
            .field("interval", &self.interval)
            .field("max_concurrent_frames", &self.max_concurrent_frames)
            .field("frame_timeout", &self.frame_timeout)
            .finish_non_exhaustive()
    }
}

// Outcome of a single frame task.
enum FrameOutcome {
    Detected(f64),
    NotDetected,
    Skipped,
}

impl EyeContactAnalyzer {
    pub fn new(extractor: Arc<dyn FrameExtractor>, detector: Arc<dyn LandmarkDetector>) -> Self {
        Self {
            extractor,
            detector,
            thresholds: GazeThresholds::default(),
            interval: crate::DEFAULT_SAMPLE_INTERVAL,
            max_concurrent_frames: super::DEFAULT_MAX_CONCURRENT_FRAMES,
            frame_timeout: Some(Duration::from_secs_f64(super::DEFAULT_FRAME_TIMEOUT)),
        }
    }

    /// Returns a new [EyeContactAnalyzer] with the provided `thresholds`.
    pub fn with_thresholds(mut self, thresholds: GazeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Returns a new [EyeContactAnalyzer] with the provided sampling `interval` (seconds).
    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    /// Returns a new [EyeContactAnalyzer] with the provided `max_concurrent_frames`.
    pub fn with_max_concurrent_frames(mut self, max_concurrent_frames: usize) -> Self {
        self.max_concurrent_frames = max_concurrent_frames.max(1);
        self
    }

    /// Returns a new [EyeContactAnalyzer] with the provided per-frame `frame_timeout`.
    ///
    /// `None` disables the timeout.
    pub fn with_frame_timeout(mut self, frame_timeout: Option<Duration>) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    // Extracts, detects and classifies one frame. Runs on a blocking thread.
    fn process_frame(
        extractor: &dyn FrameExtractor,
        detector: &dyn LandmarkDetector,
        thresholds: &GazeThresholds,
        at: f64,
    ) -> FrameOutcome {
        let frame = match extractor.extract(at) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(at, "no frame at timestamp");
                return FrameOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(at, "frame extraction failed: {}", e);
                return FrameOutcome::Skipped;
            }
        };

        let faces = match detector.detect(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(at, "landmark detection failed: {}", e);
                return FrameOutcome::NotDetected;
            }
        };

        if frame_has_eye_contact(&faces, thresholds) {
            FrameOutcome::Detected(at)
        } else {
            FrameOutcome::NotDetected
        }
    }

    /// Runs the analyzer over a video of the given `duration` (seconds).
    ///
    /// Returns once every sampled frame has been processed, or [Error::Cancelled] as soon
    /// as `cancel` fires. Outstanding frame tasks are aborted on cancellation.
    pub async fn run(&self, duration: f64, cancel: &CancellationToken) -> Result<EyeContactTimeline> {
        let span = tracing::span!(tracing::Level::DEBUG, "eye_contact", duration);
        self.run_frames(duration, cancel).instrument(span).await
    }

    async fn run_frames(
        &self,
        duration: f64,
        cancel: &CancellationToken,
    ) -> Result<EyeContactTimeline> {
        let schedule = sample_timestamps(duration, self.interval)?;
        let total = schedule.count_total();
        let sentinel = schedule.last_timestamp();
        tracing::debug!(total, interval = self.interval, "starting eye contact analysis");

        // Admission gate: a permit is held from just before a frame task is spawned until
        // its blocking work returns, on every path.
        let gate = Arc::new(Semaphore::new(self.max_concurrent_frames));
        let mut tasks = JoinSet::new();

        for at in schedule {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                permit = gate.clone().acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
            };

            let extractor = self.extractor.clone();
            let detector = self.detector.clone();
            let thresholds = self.thresholds;
            let frame_timeout = self.frame_timeout;

            tasks.spawn(async move {
                let work = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    Self::process_frame(extractor.as_ref(), detector.as_ref(), &thresholds, at)
                });
                let outcome = match frame_timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            tracing::warn!(at, "frame processing timed out");
                            return FrameOutcome::Skipped;
                        }
                    },
                    None => work.await,
                };
                match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(at, "frame task failed: {}", e);
                        FrameOutcome::Skipped
                    }
                }
            });
        }

        let mut detections = Vec::new();
        let mut skipped = 0usize;
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                // The set is drained: every sampled frame, including the last one, is done.
                None => break,
                Some(Ok(FrameOutcome::Detected(at))) => detections.push(at),
                Some(Ok(FrameOutcome::NotDetected)) => (),
                Some(Ok(FrameOutcome::Skipped)) => skipped += 1,
                Some(Err(e)) => {
                    tracing::warn!("frame task failed: {}", e);
                    skipped += 1;
                }
            }
        }

        let timeline = EyeContactTimeline::from_timestamps(detections);
        tracing::debug!(
            total,
            skipped,
            detections = timeline.len(),
            last = ?sentinel,
            "completed eye contact analysis"
        );

        Ok(timeline)
    }
}
