//! Runs the emotion and eye-contact analyses over one video.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audio::{EmotionAnalyzer, FfmpegSegmentSource, SegmentSource, SoundClassifier};
use crate::sync::PlaybackSynchronizer;
use crate::timeline::{EmotionEvent, EmotionTimeline, EyeContactTimeline};
use crate::video::{
    EyeContactAnalyzer, FfmpegFrameExtractor, FrameExtractor, GazeThresholds, LandmarkDetector,
};
use crate::{util, Error, Result};

/// Track layout and duration of a media file.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MediaInfo {
    /// Duration in seconds.
    pub duration: f64,
    pub audio_tracks: usize,
    pub video_tracks: usize,
}

impl MediaInfo {
    // Preconditions that must hold before any analysis starts.
    fn check(&self, source: &Path) -> Result<()> {
        if self.audio_tracks == 0 {
            return Err(Error::MissingAudioTrack(source.to_owned()));
        }
        if self.video_tracks == 0 {
            return Err(Error::MissingVideoTrack(source.to_owned()));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(Error::DurationUnavailable(source.to_owned()));
        }
        Ok(())
    }
}

/// Everything a session needs to analyze one source.
pub struct AnalysisInputs {
    pub source: PathBuf,
    pub source_md5: Option<String>,
    pub media: MediaInfo,
    pub segments: Box<dyn SegmentSource>,
    pub extractor: Arc<dyn FrameExtractor>,
}

/// Receives results while a session runs.
///
/// Emotion events arrive one at a time in chronological order. The eye-contact result
/// arrives once, after every sampled frame has been processed. Nothing is delivered after
/// the session is cancelled.
pub trait AnalysisObserver: Send + Sync {
    fn on_emotion_event(&self, _event: &EmotionEvent) {}
    fn on_eye_contact_result(&self, _timeline: &EyeContactTimeline) {}
}

impl AnalysisObserver for () {}

/// Both timelines for one source.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisReport {
    pub source: PathBuf,
    pub source_md5: Option<String>,
    pub duration: f64,
    pub emotions: EmotionTimeline,
    pub eye_contact: EyeContactTimeline,
}

impl AnalysisReport {
    /// Builds a synchronizer over this report's timelines.
    pub fn synchronizer(&self, window: f64) -> PlaybackSynchronizer {
        PlaybackSynchronizer::new(self.emotions.clone(), self.eye_contact.clone())
            .with_window(window)
    }
}

/// Runs one analysis at a time over a video, with support for cancelling it.
#[derive(Debug)]
pub struct AnalysisSession {
    interval: f64,
    max_concurrent_frames: usize,
    max_frame_dimension: u32,
    frame_timeout: Option<Duration>,
    thresholds: GazeThresholds,
    threaded_decoding: bool,
    cancel: CancellationToken,
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self {
            interval: crate::DEFAULT_SAMPLE_INTERVAL,
            max_concurrent_frames: crate::video::DEFAULT_MAX_CONCURRENT_FRAMES,
            max_frame_dimension: crate::video::DEFAULT_MAX_FRAME_DIMENSION,
            frame_timeout: Some(Duration::from_secs_f64(crate::video::DEFAULT_FRAME_TIMEOUT)),
            thresholds: GazeThresholds::default(),
            threaded_decoding: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new [AnalysisSession] with the provided frame sampling `interval` (seconds).
    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    /// Returns a new [AnalysisSession] with the provided `max_concurrent_frames`.
    pub fn with_max_concurrent_frames(mut self, max_concurrent_frames: usize) -> Self {
        self.max_concurrent_frames = max_concurrent_frames;
        self
    }

    /// Returns a new [AnalysisSession] with the provided `max_frame_dimension` (pixels).
    pub fn with_max_frame_dimension(mut self, max_frame_dimension: u32) -> Self {
        self.max_frame_dimension = max_frame_dimension;
        self
    }

    /// Returns a new [AnalysisSession] with the provided per-frame `frame_timeout`.
    pub fn with_frame_timeout(mut self, frame_timeout: Option<Duration>) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    /// Returns a new [AnalysisSession] with the provided gaze `thresholds`.
    pub fn with_thresholds(mut self, thresholds: GazeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Returns a new [AnalysisSession] with `threaded_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    /// Cancels the run in progress, if any. Every later run on this session is cancelled too
    /// until [AnalysisSession::reset] is called.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels any outstanding work and prepares the session for a new run.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
    }

    /// Frame sampling interval (seconds).
    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Analyzes the video at `path` with FFmpeg-backed audio and frame sources.
    ///
    /// The track layout and duration are checked before any analysis starts.
    pub async fn run<C>(
        &self,
        path: impl AsRef<Path>,
        classifier: C,
        detector: Arc<dyn LandmarkDetector>,
        observer: &dyn AnalysisObserver,
    ) -> Result<AnalysisReport>
    where
        C: SoundClassifier + 'static,
    {
        let source = path.as_ref().to_owned();

        let probe_path = source.clone();
        let (media, source_md5) = tokio::task::spawn_blocking(move || {
            let media = util::probe_media(&probe_path)?;
            let md5 = util::compute_header_md5sum(&probe_path)?;
            Ok::<_, Error>((media, md5))
        })
        .await??;
        media.check(&source)?;

        let segments = FfmpegSegmentSource::for_classifier(&source, &classifier)
            .with_threaded_decoding(self.threaded_decoding);
        let extractor =
            FfmpegFrameExtractor::new(&source).with_max_dimension(self.max_frame_dimension);

        let inputs = AnalysisInputs {
            source,
            source_md5: Some(source_md5),
            media,
            segments: Box::new(segments),
            extractor: Arc::new(extractor),
        };
        self.run_with(inputs, classifier, detector, observer).await
    }

    /// Analyzes the given inputs.
    ///
    /// The emotion scan runs on a blocking thread and streams its events back as they are
    /// produced, while the eye-contact analyzer samples frames concurrently. A stage-level
    /// failure on either side aborts the run; no partial report is returned.
    pub async fn run_with<C>(
        &self,
        inputs: AnalysisInputs,
        classifier: C,
        detector: Arc<dyn LandmarkDetector>,
        observer: &dyn AnalysisObserver,
    ) -> Result<AnalysisReport>
    where
        C: SoundClassifier + 'static,
    {
        let AnalysisInputs {
            source,
            source_md5,
            media,
            mut segments,
            extractor,
        } = inputs;
        media.check(&source)?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Stops whatever is still running when this run returns, on any path.
        let cancel = self.cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        tracing::info!(
            duration = media.duration,
            "analyzing {}",
            source.display()
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scan_cancel = cancel.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let mut tx = tx;
            EmotionAnalyzer::new(classifier).run(segments.as_mut(), &mut tx, &scan_cancel)
        });

        let emotions = async {
            let mut timeline = EmotionTimeline::new();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    event = rx.recv() => event,
                };
                match event {
                    Some(event) => {
                        // The token may fire between receiving and delivering.
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        observer.on_emotion_event(&event);
                        timeline.push(event);
                    }
                    // The sender is dropped once the scan is done.
                    None => break,
                }
            }
            scan.await??;
            Ok::<_, Error>(timeline)
        };

        let analyzer = EyeContactAnalyzer::new(extractor, detector)
            .with_thresholds(self.thresholds)
            .with_interval(self.interval)
            .with_max_concurrent_frames(self.max_concurrent_frames)
            .with_frame_timeout(self.frame_timeout);
        let eye_contact = async {
            let timeline = analyzer.run(media.duration, &cancel).await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            observer.on_eye_contact_result(&timeline);
            Ok::<_, Error>(timeline)
        };

        let (emotions, eye_contact) = tokio::try_join!(emotions, eye_contact)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tracing::info!(
            emotions = emotions.len(),
            eye_contact = eye_contact.len(),
            "analysis complete"
        );

        Ok(AnalysisReport {
            source,
            source_md5,
            duration: media.duration,
            emotions,
            eye_contact,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::audio::{AudioSegment, Classification};
    use crate::video::{synthetic_face, FaceObservation, Frame};

    // Labels a segment "happy" if its first sample is positive, otherwise "neutral".
    struct SignClassifier;

    impl SoundClassifier for SignClassifier {
        fn sample_rate(&self) -> u32 {
            4
        }

        fn window_duration(&self) -> f64 {
            1.0
        }

        fn overlap(&self) -> f64 {
            0.0
        }

        fn classify(&mut self, segment: &AudioSegment) -> Result<Vec<Classification>> {
            let label = if segment.samples[0] > 0.0 { "happy" } else { "neutral" };
            Ok(vec![Classification {
                label: label.to_string(),
                confidence: 1.0,
            }])
        }
    }

    // Feeds segments slowly, so that a run can be cancelled mid-scan.
    struct SlowSegments {
        count: usize,
        delay: Duration,
    }

    impl SegmentSource for SlowSegments {
        fn scan(&mut self, on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>) -> Result<()> {
            for i in 0..self.count {
                std::thread::sleep(self.delay);
                on_segment(AudioSegment {
                    start: i as f64,
                    sample_rate: 4,
                    samples: vec![1.0; 4],
                })?;
            }
            Ok(())
        }
    }

    struct FailingSegments;

    impl SegmentSource for FailingSegments {
        fn scan(&mut self, _on_segment: &mut dyn FnMut(AudioSegment) -> Result<()>) -> Result<()> {
            Err(Error::MissingAudioTrack(PathBuf::from("talk.mp4")))
        }
    }

    struct BlankExtractor {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FrameExtractor for BlankExtractor {
        fn extract(&self, at: f64) -> Result<Option<Frame>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(Some(Frame {
                timestamp: at,
                image: image::RgbImage::new(2, 2),
            }))
        }
    }

    fn extractor(delay: Duration) -> Arc<BlankExtractor> {
        Arc::new(BlankExtractor {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    // Eye contact in the half-open window `[1.0, 1.3)`.
    struct ScriptedDetector;

    impl LandmarkDetector for ScriptedDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>> {
            if frame.timestamp >= 1.0 - 1e-9 && frame.timestamp < 1.3 - 1e-9 {
                Ok(vec![synthetic_face(0.0, 0.0, 0.0)])
            } else {
                Ok(vec![synthetic_face(0.5, 0.0, 0.0)])
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        emotions: Mutex<Vec<(String, f64)>>,
        eye_contact_results: AtomicUsize,
    }

    impl AnalysisObserver for Recorder {
        fn on_emotion_event(&self, event: &EmotionEvent) {
            if let Ok(mut emotions) = self.emotions.lock() {
                emotions.push((event.label().to_string(), event.time()));
            }
        }

        fn on_eye_contact_result(&self, _timeline: &EyeContactTimeline) {
            self.eye_contact_results.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn inputs(
        media: MediaInfo,
        segments: Box<dyn SegmentSource>,
        extractor: Arc<dyn FrameExtractor>,
    ) -> AnalysisInputs {
        AnalysisInputs {
            source: PathBuf::from("talk.mp4"),
            source_md5: None,
            media,
            segments,
            extractor,
        }
    }

    fn media(duration: f64) -> MediaInfo {
        MediaInfo {
            duration,
            audio_tracks: 1,
            video_tracks: 1,
        }
    }

    fn segment(start: f64, first: f32) -> AudioSegment {
        AudioSegment {
            start,
            sample_rate: 4,
            samples: vec![first, 0.0, 0.0, 0.0],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_produces_both_timelines() {
        let session = AnalysisSession::new().with_interval(0.1);
        let recorder = Recorder::default();
        let segments = vec![segment(0.0, 0.0), segment(1.0, 1.0), segment(2.0, 0.0)];

        let report = session
            .run_with(
                inputs(
                    media(2.0),
                    Box::new(segments),
                    extractor(Duration::ZERO),
                ),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &recorder,
            )
            .await
            .unwrap();

        let emotions = recorder.emotions.lock().unwrap().clone();
        assert_eq!(
            emotions,
            vec![
                ("neutral".to_string(), 0.0),
                ("happy".to_string(), 1.0),
                ("neutral".to_string(), 2.0),
            ]
        );
        assert_eq!(report.emotions.len(), 3);
        assert_eq!(recorder.eye_contact_results.load(Ordering::SeqCst), 1);
        assert_eq!(report.eye_contact.len(), 3);

        let sync = report.synchronizer(0.1);
        let state = sync.resolve(1.15);
        assert_eq!(state.current_emotion.as_deref(), Some("happy"));
        assert!(state.current_eye_contact);
        assert!(!sync.resolve(1.6).current_eye_contact);
    }

    #[tokio::test]
    async fn test_missing_tracks_fail_before_analysis() {
        let session = AnalysisSession::new();
        let recorder = Recorder::default();
        let frames = extractor(Duration::ZERO);

        let no_audio = MediaInfo {
            audio_tracks: 0,
            ..media(1.0)
        };
        let result = session
            .run_with(
                inputs(no_audio, Box::new(vec![segment(0.0, 1.0)]), frames.clone()),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &recorder,
            )
            .await;
        assert!(matches!(result, Err(Error::MissingAudioTrack(_))));

        let no_video = MediaInfo {
            video_tracks: 0,
            ..media(1.0)
        };
        let result = session
            .run_with(
                inputs(no_video, Box::new(vec![segment(0.0, 1.0)]), frames.clone()),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &recorder,
            )
            .await;
        assert!(matches!(result, Err(Error::MissingVideoTrack(_))));

        assert_eq!(frames.calls.load(Ordering::SeqCst), 0);
        assert!(recorder.emotions.lock().unwrap().is_empty());
        assert_eq!(recorder.eye_contact_results.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stage_failure_returns_no_report() {
        let session = AnalysisSession::new();
        let recorder = Recorder::default();

        let result = session
            .run_with(
                inputs(
                    media(1.0),
                    Box::new(FailingSegments),
                    extractor(Duration::from_millis(5)),
                ),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &recorder,
            )
            .await;

        assert!(matches!(result, Err(Error::MissingAudioTrack(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_suppresses_callbacks() {
        let session = Arc::new(AnalysisSession::new());
        let recorder = Recorder::default();

        let canceller = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = session
            .run_with(
                inputs(
                    media(100.0),
                    Box::new(SlowSegments {
                        count: 1000,
                        delay: Duration::from_millis(20),
                    }),
                    extractor(Duration::from_millis(20)),
                ),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &recorder,
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(recorder.eye_contact_results.load(Ordering::SeqCst), 0);

        // Nothing else is delivered once the run has returned.
        let delivered = recorder.emotions.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.emotions.lock().unwrap().len(), delivered);
        assert!(delivered < 1000);
    }

    // Cancels its session from inside the first emotion callback.
    struct CancellingObserver {
        session: Arc<AnalysisSession>,
        emotion_events: AtomicUsize,
    }

    impl AnalysisObserver for CancellingObserver {
        fn on_emotion_event(&self, _event: &EmotionEvent) {
            self.emotion_events.fetch_add(1, Ordering::SeqCst);
            self.session.cancel();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_from_callback_stops_delivery() {
        for _ in 0..20 {
            let session = Arc::new(AnalysisSession::new());
            let observer = CancellingObserver {
                session: session.clone(),
                emotion_events: AtomicUsize::new(0),
            };
            // Queued well ahead of the consumer.
            let segments: Vec<AudioSegment> =
                (0..500).map(|i| segment(i as f64, 1.0)).collect();

            let result = session
                .run_with(
                    inputs(
                        media(100.0),
                        Box::new(segments),
                        extractor(Duration::from_millis(5)),
                    ),
                    SignClassifier,
                    Arc::new(ScriptedDetector),
                    &observer,
                )
                .await;

            assert!(matches!(result, Err(Error::Cancelled)));
            assert_eq!(observer.emotion_events.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_allows_a_new_run() {
        let mut session = AnalysisSession::new().with_interval(0.5);
        session.cancel();
        assert!(session.is_cancelled());

        let result = session
            .run_with(
                inputs(media(1.0), Box::new(vec![segment(0.0, 1.0)]), extractor(Duration::ZERO)),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &(),
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));

        session.reset();
        assert!(!session.is_cancelled());
        let report = session
            .run_with(
                inputs(media(1.0), Box::new(vec![segment(0.0, 1.0)]), extractor(Duration::ZERO)),
                SignClassifier,
                Arc::new(ScriptedDetector),
                &(),
            )
            .await
            .unwrap();
        assert_eq!(report.emotions.len(), 1);
        assert!(report.eye_contact.is_empty());
    }
}
