mod analyzer;
mod extractor;
mod geometry;
mod landmarks;

pub use analyzer::EyeContactAnalyzer;
pub use extractor::{FfmpegFrameExtractor, Frame, FrameExtractor};
pub use geometry::{
    frame_has_eye_contact, is_making_eye_contact, FaceLandmarks, FaceObservation, GazeThresholds,
    LandmarkRegion, Point,
};
pub use landmarks::{LandmarkDetector, SidecarLandmarkDetector};

/// Default maximum number of frames extracted and classified at the same time.
///
/// Decoded frames are large, so this acts as backpressure on memory for long or
/// high-resolution videos.
pub const DEFAULT_MAX_CONCURRENT_FRAMES: usize = 2;

/// Default bound (pixels) on the width and height of extracted frames.
pub const DEFAULT_MAX_FRAME_DIMENSION: u32 = 720;

/// Default bound (seconds) on the time spent extracting and classifying one frame.
pub const DEFAULT_FRAME_TIMEOUT: f64 = 10.0;

/// Default yaw threshold (radians).
///
/// Faces turned further than this from the camera are never considered to make eye contact.
pub const DEFAULT_YAW_THRESHOLD: f64 = 0.4;

/// Default lower edge of the centered vertical band, as a fraction of the eye height.
pub const DEFAULT_VERTICAL_BAND_LOW: f64 = 0.35;

/// Default upper edge of the centered vertical band, as a fraction of the eye height.
pub const DEFAULT_VERTICAL_BAND_HIGH: f64 = 0.65;

/// Default maximum horizontal pupil deviation from the eye center (normalized units).
pub const DEFAULT_HORIZONTAL_DEVIATION_MAX: f64 = 0.02;

static LANDMARKS_FILE_EXT: &str = "landmarks.json";

#[cfg(test)]
pub(crate) use geometry::test::synthetic_face;
