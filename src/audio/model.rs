use std::path::Path;

use serde::{Deserialize, Serialize};

use super::AudioSegment;
use crate::{Error, Result};

/// One ranked label produced for a segment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

/// A pretrained sound classifier.
///
/// The classifier dictates the shape of the segments it accepts. `classify` returns every
/// known label ranked from most to least likely; an empty result means "no classification".
pub trait SoundClassifier: Send {
    fn sample_rate(&self) -> u32;
    fn window_duration(&self) -> f64;
    fn overlap(&self) -> f64;
    fn classify(&mut self, segment: &AudioSegment) -> Result<Vec<Classification>>;
}

impl<C: SoundClassifier + ?Sized> SoundClassifier for Box<C> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn window_duration(&self) -> f64 {
        (**self).window_duration()
    }

    fn overlap(&self) -> f64 {
        (**self).overlap()
    }

    fn classify(&mut self, segment: &AudioSegment) -> Result<Vec<Classification>> {
        (**self).classify(segment)
    }
}

/// Number of features extracted from each segment.
const FEATURE_COUNT: usize = 3;

#[derive(Clone, Debug, Deserialize)]
struct Centroid {
    label: String,
    centroid: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize)]
struct ModelAsset {
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default = "default_window_secs")]
    window_secs: f64,
    #[serde(default = "default_overlap")]
    overlap: f64,
    mean: Vec<f64>,
    std: Vec<f64>,
    labels: Vec<Centroid>,
}

fn default_sample_rate() -> u32 {
    super::DEFAULT_SAMPLE_RATE
}

fn default_window_secs() -> f64 {
    super::DEFAULT_SEGMENT_DURATION
}

fn default_overlap() -> f64 {
    super::DEFAULT_SEGMENT_OVERLAP
}

/// Nearest-centroid emotion classifier loaded from a pretrained JSON asset.
///
/// Each segment is reduced to three features (loudness in dBFS, zero-crossing rate and crest
/// factor), standardized with the asset's `mean` and `std`, and compared against one centroid
/// per label. Confidences are a softmax over negative distances.
///
/// ```json
/// {
///   "sample_rate": 16000, "window_secs": 1.0, "overlap": 0.5,
///   "mean": [-30.0, 0.1, 4.0], "std": [10.0, 0.05, 2.0],
///   "labels": [ { "label": "neutral", "centroid": [0.0, 0.0, 0.0] } ]
/// }
/// ```
#[derive(Clone, Debug)]
pub struct CentroidModel {
    asset: ModelAsset,
}

impl CentroidModel {
    /// Loads the model asset. Any failure is reported as [Error::ModelLoad].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let model_error = |reason: String| Error::ModelLoad {
            path: path.to_owned(),
            reason,
        };
        let data = std::fs::read(path).map_err(|e| model_error(e.to_string()))?;
        let model = Self::from_slice(&data).map_err(model_error)?;
        tracing::debug!(
            labels = model.asset.labels.len(),
            sample_rate = model.asset.sample_rate,
            "loaded model from {}",
            path.display()
        );
        Ok(model)
    }

    fn from_slice(data: &[u8]) -> std::result::Result<Self, String> {
        let asset: ModelAsset = serde_json::from_slice(data).map_err(|e| e.to_string())?;

        if asset.sample_rate == 0 {
            return Err("sample_rate must be positive".to_string());
        }
        if !(asset.window_secs > 0.0) {
            return Err("window_secs must be positive".to_string());
        }
        if !(0.0..1.0).contains(&asset.overlap) {
            return Err("overlap must be in [0, 1)".to_string());
        }
        if asset.mean.len() != FEATURE_COUNT || asset.std.len() != FEATURE_COUNT {
            return Err(format!("mean and std must have {} entries", FEATURE_COUNT));
        }
        if asset.std.iter().any(|s| !(*s > 0.0)) {
            return Err("std entries must be positive".to_string());
        }
        if asset.labels.is_empty() {
            return Err("model has no labels".to_string());
        }
        if let Some(bad) = asset
            .labels
            .iter()
            .find(|c| c.centroid.len() != FEATURE_COUNT)
        {
            return Err(format!(
                "centroid for {:?} must have {} entries",
                bad.label, FEATURE_COUNT
            ));
        }

        Ok(Self { asset })
    }

    /// Labels known to the model, in asset order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.asset.labels.iter().map(|c| c.label.as_str())
    }

    // Standardized features of a segment.
    fn features(&self, samples: &[f32]) -> [f64; FEATURE_COUNT] {
        let raw = extract_features(samples);
        let mut out = [0.0; FEATURE_COUNT];
        for (((out, raw), mean), std) in out
            .iter_mut()
            .zip(raw)
            .zip(&self.asset.mean)
            .zip(&self.asset.std)
        {
            *out = (raw - mean) / std;
        }
        out
    }
}

// Returns loudness (dBFS), zero-crossing rate and crest factor.
fn extract_features(samples: &[f32]) -> [f64; FEATURE_COUNT] {
    const FLOOR_DB: f64 = -120.0;

    if samples.is_empty() {
        return [FLOOR_DB, 0.0, 0.0];
    }

    let energy: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    let rms = (energy / samples.len() as f64).sqrt();
    let loudness = if rms > 0.0 {
        (20.0 * rms.log10()).max(FLOOR_DB)
    } else {
        FLOOR_DB
    };

    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let zcr = crossings as f64 / samples.len().saturating_sub(1).max(1) as f64;

    let peak = samples.iter().fold(0.0f64, |acc, s| acc.max((*s as f64).abs()));
    let crest = if rms > 0.0 { peak / rms } else { 0.0 };

    [loudness, zcr, crest]
}

impl SoundClassifier for CentroidModel {
    fn sample_rate(&self) -> u32 {
        self.asset.sample_rate
    }

    fn window_duration(&self) -> f64 {
        self.asset.window_secs
    }

    fn overlap(&self) -> f64 {
        self.asset.overlap
    }

    fn classify(&mut self, segment: &AudioSegment) -> Result<Vec<Classification>> {
        if segment.sample_rate != self.asset.sample_rate {
            return Err(Error::Classification(format!(
                "expected {} Hz audio, got {} Hz",
                self.asset.sample_rate, segment.sample_rate
            )));
        }

        let features = self.features(&segment.samples);
        let distances: Vec<f64> = self
            .asset
            .labels
            .iter()
            .map(|c| {
                c.centroid
                    .iter()
                    .zip(features.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect();

        // Softmax over negative distances, shifted by the minimum for numeric stability.
        let min = distances.iter().copied().fold(f64::INFINITY, f64::min);
        let weights: Vec<f64> = distances.iter().map(|d| (min - d).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mut ranked: Vec<Classification> = self
            .asset
            .labels
            .iter()
            .zip(weights)
            .map(|(c, w)| Classification {
                label: c.label.clone(),
                confidence: w / total,
            })
            .collect();
        // Stable sort, so equally likely labels keep asset order.
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Ok(ranked)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ASSET: &str = r#"{
        "sample_rate": 100,
        "window_secs": 1.0,
        "overlap": 0.5,
        "mean": [0.0, 0.0, 0.0],
        "std": [1.0, 1.0, 1.0],
        "labels": [
            { "label": "calm", "centroid": [-120.0, 0.0, 0.0] },
            { "label": "excited", "centroid": [-6.0, 1.0, 1.0] }
        ]
    }"#;

    fn segment(samples: Vec<f32>) -> AudioSegment {
        AudioSegment {
            start: 0.0,
            sample_rate: 100,
            samples,
        }
    }

    #[test]
    fn test_extract_features() {
        let [loudness, zcr, crest] = extract_features(&[0.5, -0.5, 0.5, -0.5]);
        assert!((loudness - (-6.0206)).abs() < 1e-3);
        assert_eq!(zcr, 1.0);
        assert!((crest - 1.0).abs() < 1e-9);

        assert_eq!(extract_features(&[0.0; 8]), [-120.0, 0.0, 0.0]);
        assert_eq!(extract_features(&[]), [-120.0, 0.0, 0.0]);
    }

    #[test]
    fn test_features_are_standardized() {
        let model = CentroidModel::from_slice(
            br#"{"mean": [-6.0, 0.5, 1.0], "std": [2.0, 0.25, 4.0],
                "labels": [{"label": "a", "centroid": [0,0,0]}]}"#,
        )
        .unwrap();
        let [loudness, zcr, crest] = model.features(&[0.5, -0.5, 0.5, -0.5]);
        assert!((loudness - (-0.0103)).abs() < 1e-3);
        assert!((zcr - 2.0).abs() < 1e-9);
        assert!(crest.abs() < 1e-9);
    }

    #[test]
    fn test_classify_ranks_nearest_first() {
        let mut model = CentroidModel::from_slice(ASSET.as_bytes()).unwrap();
        assert_eq!(model.labels().collect::<Vec<_>>(), vec!["calm", "excited"]);

        let silence = model.classify(&segment(vec![0.0; 100])).unwrap();
        assert_eq!(silence[0].label, "calm");

        let loud: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let ranked = model.classify(&segment(loud)).unwrap();
        assert_eq!(ranked[0].label, "excited");
        assert!(ranked[0].confidence > ranked[1].confidence);
        let total: f64 = ranked.iter().map(|c| c.confidence).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let mut model = CentroidModel::from_slice(ASSET.as_bytes()).unwrap();
        let mut s = segment(vec![0.0; 10]);
        s.sample_rate = 16000;
        assert!(matches!(model.classify(&s), Err(Error::Classification(_))));
    }

    #[test]
    fn test_invalid_assets() {
        assert!(CentroidModel::from_slice(b"not json").is_err());
        assert!(CentroidModel::from_slice(
            br#"{"sample_rate": 100, "window_secs": 1.0, "mean": [0,0,0], "std": [1,1,1], "labels": []}"#
        )
        .is_err());
        assert!(CentroidModel::from_slice(
            br#"{"sample_rate": 100, "window_secs": 1.0, "mean": [0,0,0], "std": [1,0,1],
                "labels": [{"label": "a", "centroid": [0,0,0]}]}"#
        )
        .is_err());
        assert!(CentroidModel::from_slice(
            br#"{"sample_rate": 100, "window_secs": 1.0, "mean": [0,0,0], "std": [1,1,1],
                "labels": [{"label": "a", "centroid": [0,0]}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_segmentation_defaults() {
        let model = CentroidModel::from_slice(
            br#"{"mean": [0,0,0], "std": [1,1,1], "labels": [{"label": "a", "centroid": [0,0,0]}]}"#,
        )
        .unwrap();
        assert_eq!(model.sample_rate(), crate::audio::DEFAULT_SAMPLE_RATE);
        assert_eq!(model.window_duration(), crate::audio::DEFAULT_SEGMENT_DURATION);
        assert_eq!(model.overlap(), crate::audio::DEFAULT_SEGMENT_OVERLAP);
    }

    #[test]
    fn test_load_failure_is_model_error() {
        match CentroidModel::load("/nonexistent/emotion-model.json") {
            Err(Error::ModelLoad { path, .. }) => {
                assert!(path.ends_with("emotion-model.json"))
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
