mod analyzer;
mod decoder;
mod model;

pub use analyzer::{EmotionAnalyzer, EmotionSink};
pub use decoder::{AudioSegment, FfmpegSegmentSource, SegmentSource};
pub use model::{CentroidModel, Classification, SoundClassifier};

/// Default classifier window (seconds).
///
/// Used when a classifier asset does not specify its own window.
pub const DEFAULT_SEGMENT_DURATION: f64 = 1.0;

/// Default overlap between successive classifier windows, as a fraction of the window.
pub const DEFAULT_SEGMENT_OVERLAP: f64 = 0.5;

/// Default sample rate (Hz) that audio is resampled to before classification.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
