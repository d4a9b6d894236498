use std::path::PathBuf;

pub mod audio;
pub mod sampler;
pub mod session;
pub mod sync;
pub mod timeline;
pub mod util;
pub mod video;

/// Default sampling interval (seconds) between analyzed video frames.
///
/// Kept equal to [DEFAULT_EYE_CONTACT_WINDOW] so that a detection covers the whole gap
/// between two sampled frames.
pub const DEFAULT_SAMPLE_INTERVAL: f64 = 0.1;

/// Default eye-contact proximity window (seconds).
///
/// Playback is considered to be "in eye contact" if a positive detection exists strictly
/// within this distance of the current playback time.
pub const DEFAULT_EYE_CONTACT_WINDOW: f64 = 0.1;

/// Default cadence (seconds) at which a player polls the synchronizer.
pub const DEFAULT_PLAYBACK_CADENCE: f64 = 0.2;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no audio track found in: {0:?}")]
    MissingAudioTrack(PathBuf),
    #[error("no video track found in: {0:?}")]
    MissingVideoTrack(PathBuf),
    #[error("unable to determine duration of: {0:?}")]
    DurationUnavailable(PathBuf),
    #[error("failed to load model from {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("landmark data not found at: {0:?}")]
    LandmarkDataNotFound(PathBuf),
    #[error("sampling interval must be positive, got {0}")]
    InvalidInterval(f64),
    #[error("duration must be a non-negative number, got {0}")]
    InvalidDuration(f64),
    #[error("timestamp must be non-negative, got {0}")]
    NegativeTimestamp(f64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("frame extraction failed at {at}s: {reason}")]
    FrameExtraction { at: f64, reason: String },
    #[error("landmark detection failed: {0}")]
    LandmarkDetection(String),
    #[error("classification failed: {0}")]
    Classification(String),
    #[error("analysis was cancelled")]
    Cancelled,
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
