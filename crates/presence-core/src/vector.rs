//! Fixed-length face feature vectors and the distance metric used to compare them.

use serde::{Deserialize, Serialize};

/// Default feature dimensionality (dlib-style 128-d face encodings).
pub const DEFAULT_DIMENSION: usize = 128;

/// Face feature vector produced by an external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// L2 norm, accumulated in f64.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }

    /// Return an L2-normalized copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> FeatureVector {
        let norm = self.norm();
        if norm > 0.0 {
            FeatureVector {
                values: self
                    .values
                    .iter()
                    .map(|&x| (f64::from(x) / norm) as f32)
                    .collect(),
            }
        } else {
            self.clone()
        }
    }

    /// Euclidean distance to `other`.
    ///
    /// Squared differences are accumulated in f64 so that the result is stable
    /// well below the tie epsilon regardless of dimensionality. Callers must
    /// check dimensions first; extra components of the longer vector are ignored.
    pub fn distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum::<f64>()
            .sqrt() as f32
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}
