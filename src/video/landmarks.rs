use std::path::Path;

use serde::Deserialize;

use super::{FaceObservation, Frame};
use crate::{Error, Result};

/// Finds faces and their eye landmarks in a frame.
///
/// Coordinates are normalized to each face (`0.0..=1.0` on both axes).
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>>;
}

#[derive(Debug, Deserialize)]
struct SidecarEntry {
    time: f64,
    #[serde(default)]
    faces: Vec<FaceObservation>,
}

#[derive(Debug, Deserialize)]
struct SidecarFile {
    frames: Vec<SidecarEntry>,
}

/// Serves face landmarks computed ahead of time by an external landmark model.
///
/// The data lives in a JSON file stored alongside the video (`<video>.landmarks.json`):
///
/// ```json
/// { "frames": [ { "time": 0.0, "faces": [ { "yaw": 0.1, "landmarks": { ... } } ] } ] }
/// ```
///
/// A frame is matched to the entry closest to its timestamp, provided that entry lies
/// within the configured tolerance.
#[derive(Debug)]
pub struct SidecarLandmarkDetector {
    entries: Vec<SidecarEntry>,
    tolerance: f64,
}

impl SidecarLandmarkDetector {
    /// Load landmark data from a path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::LandmarkDataNotFound(path.to_owned()));
        }
        let f = std::fs::File::open(path)?;
        let data: SidecarFile = serde_json::from_reader(std::io::BufReader::new(f))?;
        Ok(Self::from_entries(data.frames))
    }

    /// Load landmark data stored alongside the given video.
    pub fn from_video(video: impl AsRef<Path>) -> Result<Self> {
        let path = video
            .as_ref()
            .to_owned()
            .with_extension(super::LANDMARKS_FILE_EXT);
        Self::from_path(path)
    }

    fn from_entries(mut entries: Vec<SidecarEntry>) -> Self {
        entries.retain(|e| e.time.is_finite());
        entries.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            entries,
            tolerance: crate::DEFAULT_SAMPLE_INTERVAL / 2.0,
        }
    }

    /// Returns a new [SidecarLandmarkDetector] with the provided match `tolerance` (seconds).
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Matches each frame against entries within half the sampling `interval` (seconds),
    /// so that every entry can serve the sampled frame closest to it.
    pub fn with_sampling_interval(self, interval: f64) -> Self {
        self.with_tolerance(interval / 2.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn nearest(&self, time: f64) -> Option<&SidecarEntry> {
        let idx = self.entries.partition_point(|e| e.time < time);
        let after = self.entries.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.entries.get(i));
        after
            .into_iter()
            .chain(before)
            .filter(|e| (e.time - time).abs() <= self.tolerance)
            .min_by(|a, b| (a.time - time).abs().total_cmp(&(b.time - time).abs()))
    }
}

impl LandmarkDetector for SidecarLandmarkDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>> {
        Ok(self
            .nearest(frame.timestamp)
            .map(|e| e.faces.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIDECAR: &str = r#"{
        "frames": [
            { "time": 0.5, "faces": [ { "yaw": 0.7 } ] },
            { "time": 0.0, "faces": [] },
            {
                "time": 0.1,
                "faces": [
                    {
                        "yaw": 0.05,
                        "landmarks": {
                            "left_eye": [ { "x": 0.25, "y": 0.6 }, { "x": 0.35, "y": 0.6 } ],
                            "left_pupil": [ { "x": 0.3, "y": 0.6 } ]
                        }
                    }
                ]
            }
        ]
    }"#;

    fn frame_at(timestamp: f64) -> Frame {
        Frame {
            timestamp,
            image: image::RgbImage::new(4, 4),
        }
    }

    fn detector() -> SidecarLandmarkDetector {
        let data: SidecarFile = serde_json::from_str(SIDECAR).unwrap();
        SidecarLandmarkDetector::from_entries(data.frames)
    }

    #[test]
    fn test_nearest_entry() {
        let detector = detector();
        assert_eq!(detector.len(), 3);

        let faces = detector.detect(&frame_at(0.11)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].yaw, Some(0.05));
        let landmarks = faces[0].landmarks.as_ref().unwrap();
        assert_eq!(landmarks.left_eye.as_ref().unwrap().points().len(), 2);
        assert!(landmarks.right_eye.is_none());

        assert!(detector.detect(&frame_at(0.0)).unwrap().is_empty());
        assert_eq!(detector.detect(&frame_at(0.52)).unwrap()[0].yaw, Some(0.7));
    }

    #[test]
    fn test_outside_tolerance() {
        let detector = detector();
        assert!(detector.detect(&frame_at(0.3)).unwrap().is_empty());
        assert!(detector
            .with_tolerance(0.25)
            .detect(&frame_at(0.3))
            .unwrap()
            .len()
            == 1);
    }

    #[test]
    fn test_tolerance_follows_sampling_interval() {
        // Entries every 0.3s, frames sampled every 0.5s.
        let entries = (0..4)
            .map(|i| SidecarEntry {
                time: i as f64 * 0.3,
                faces: vec![FaceObservation {
                    yaw: Some(i as f64),
                    landmarks: None,
                }],
            })
            .collect();
        let detector = SidecarLandmarkDetector::from_entries(entries);
        assert!(detector.detect(&frame_at(0.5)).unwrap().is_empty());

        let detector = detector.with_sampling_interval(0.5);
        let faces = detector.detect(&frame_at(0.5)).unwrap();
        assert_eq!(faces[0].yaw, Some(2.0));
        assert_eq!(detector.detect(&frame_at(1.0)).unwrap()[0].yaw, Some(3.0));
    }

    #[test]
    fn test_missing_sidecar() {
        assert!(matches!(
            SidecarLandmarkDetector::from_video("/nonexistent/talk.mp4"),
            Err(Error::LandmarkDataNotFound(p)) if p.ends_with("talk.landmarks.json")
        ));
    }
}
