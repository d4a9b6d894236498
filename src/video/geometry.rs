use serde::{Deserialize, Serialize};

/// A point in the face-relative normalized coordinate space (`0.0..=1.0` on each axis).
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The points of one landmark region (an eye contour or a pupil).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LandmarkRegion(pub Vec<Point>);

impl LandmarkRegion {
    pub fn points(&self) -> &[Point] {
        &self.0
    }
}

impl From<Vec<Point>> for LandmarkRegion {
    fn from(points: Vec<Point>) -> Self {
        Self(points)
    }
}

/// Eye and pupil landmarks of a single face. Any region may be missing when the
/// detector could not place it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FaceLandmarks {
    #[serde(default)]
    pub left_eye: Option<LandmarkRegion>,
    #[serde(default)]
    pub right_eye: Option<LandmarkRegion>,
    #[serde(default)]
    pub left_pupil: Option<LandmarkRegion>,
    #[serde(default)]
    pub right_pupil: Option<LandmarkRegion>,
}

/// One face found in a frame.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FaceObservation {
    /// Head yaw in radians, if the detector estimated it.
    #[serde(default)]
    pub yaw: Option<f64>,
    #[serde(default)]
    pub landmarks: Option<FaceLandmarks>,
}

/// Thresholds of the eye-contact heuristic.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GazeThresholds {
    /// Faces turned further than this (radians, absolute) are rejected.
    pub yaw_threshold: f64,
    /// Lower edge of the centered vertical band, as a fraction of eye height.
    pub vertical_band_low: f64,
    /// Upper edge of the centered vertical band, as a fraction of eye height.
    pub vertical_band_high: f64,
    /// Maximum horizontal pupil offset from the eye center (normalized units, exclusive).
    pub horizontal_deviation_max: f64,
}

impl Default for GazeThresholds {
    fn default() -> Self {
        Self {
            yaw_threshold: super::DEFAULT_YAW_THRESHOLD,
            vertical_band_low: super::DEFAULT_VERTICAL_BAND_LOW,
            vertical_band_high: super::DEFAULT_VERTICAL_BAND_HIGH,
            horizontal_deviation_max: super::DEFAULT_HORIZONTAL_DEVIATION_MAX,
        }
    }
}

impl GazeThresholds {
    /// Checks that the thresholds describe a usable band.
    pub fn validate(&self) -> crate::Result<()> {
        let fraction = 0.0..=1.0;
        if !(self.yaw_threshold >= 0.0) {
            return Err(crate::Error::InvalidConfig(format!(
                "yaw_threshold must be non-negative, got {}",
                self.yaw_threshold
            )));
        }
        if !fraction.contains(&self.vertical_band_low)
            || !fraction.contains(&self.vertical_band_high)
            || self.vertical_band_low > self.vertical_band_high
        {
            return Err(crate::Error::InvalidConfig(format!(
                "vertical band must satisfy 0 <= low <= high <= 1, got [{}, {}]",
                self.vertical_band_low, self.vertical_band_high
            )));
        }
        if !(self.horizontal_deviation_max > 0.0) {
            return Err(crate::Error::InvalidConfig(format!(
                "horizontal_deviation_max must be positive, got {}",
                self.horizontal_deviation_max
            )));
        }
        Ok(())
    }

    /// Loads thresholds from a JSON file. Options missing from the file keep their defaults.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let f = std::fs::File::open(path.as_ref())?;
        let thresholds: Self = serde_json::from_reader(std::io::BufReader::new(f))?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

// Returns true if the pupil sits in the centered band of the eye, both vertically and
// horizontally. The pupil position is its first point.
fn is_centered(pupil: &LandmarkRegion, eye: &LandmarkRegion, thresholds: &GazeThresholds) -> bool {
    let (pupil, eye) = (pupil.points(), eye.points());
    if pupil.is_empty() || eye.len() < 2 {
        return false;
    }
    let pupil = pupil[0];

    let min_y = eye.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = eye.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    let height = max_y - min_y;
    let band_low = min_y + height * thresholds.vertical_band_low;
    let band_high = min_y + height * thresholds.vertical_band_high;
    let in_band = pupil.y >= band_low && pupil.y <= band_high;

    let center_x = eye.iter().map(|p| p.x).sum::<f64>() / eye.len() as f64;
    let delta_x = (pupil.x - center_x).abs();

    tracing::trace!(delta_x, pupil_y = pupil.y, in_band, "pupil position");

    delta_x < thresholds.horizontal_deviation_max && in_band
}

/// Judges whether a single face is making eye contact with the camera.
///
/// The face must not be turned past the yaw threshold, and both pupils must be centered
/// within their eyes. This is a geometric heuristic rather than a calibrated gaze estimate.
pub fn is_making_eye_contact(face: &FaceObservation, thresholds: &GazeThresholds) -> bool {
    if let Some(yaw) = face.yaw {
        if !yaw.is_finite() || yaw.abs() > thresholds.yaw_threshold {
            tracing::trace!(yaw, "face turned away");
            return false;
        }
    }

    let landmarks = match &face.landmarks {
        Some(landmarks) => landmarks,
        None => return false,
    };
    match (
        &landmarks.left_pupil,
        &landmarks.left_eye,
        &landmarks.right_pupil,
        &landmarks.right_eye,
    ) {
        (Some(left_pupil), Some(left_eye), Some(right_pupil), Some(right_eye)) => {
            is_centered(left_pupil, left_eye, thresholds)
                && is_centered(right_pupil, right_eye, thresholds)
        }
        _ => false,
    }
}

/// Judges a whole frame: eye contact if any detected face makes it. No faces means no contact.
pub fn frame_has_eye_contact(faces: &[FaceObservation], thresholds: &GazeThresholds) -> bool {
    faces
        .iter()
        .any(|face| is_making_eye_contact(face, thresholds))
}
