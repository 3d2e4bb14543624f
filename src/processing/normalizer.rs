//! Per-column feature standardization.
//!
//! Statistics are fitted once on the training features of an operating point
//! and frozen into the artifact; inference reuses them unchanged.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::ProcessingError;
use crate::config::defaults::STD_EPSILON;

/// Frozen per-column mean and (epsilon-floored) standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl FeatureStats {
    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Fits and applies [`FeatureStats`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    stats: FeatureStats,
}

impl Normalizer {
    /// Fit on a `[B, D]` feature matrix. Uses the population standard
    /// deviation plus a small epsilon so constant columns never divide by zero.
    pub fn fit(features: &Array2<f64>) -> Result<Self, ProcessingError> {
        if features.nrows() == 0 {
            return Err(ProcessingError::InsufficientData {
                window: 1,
                available: 0,
            });
        }
        let mean = features
            .mean_axis(Axis(0))
            .ok_or(ProcessingError::InsufficientData { window: 1, available: 0 })?;
        let std = features.std_axis(Axis(0), 0.0) + STD_EPSILON;
        Ok(Self {
            stats: FeatureStats { mean, std },
        })
    }

    pub fn from_stats(stats: FeatureStats) -> Result<Self, ProcessingError> {
        if stats.mean.len() != stats.std.len() {
            return Err(ProcessingError::FeatureDimensionMismatch {
                expected: stats.mean.len(),
                actual: stats.std.len(),
            });
        }
        Ok(Self { stats })
    }

    pub fn stats(&self) -> &FeatureStats {
        &self.stats
    }

    pub fn into_stats(self) -> FeatureStats {
        self.stats
    }

    /// `(x - mean) / std`, column-wise.
    pub fn transform(&self, features: &Array2<f64>) -> Result<Array2<f64>, ProcessingError> {
        if features.ncols() != self.stats.dim() {
            return Err(ProcessingError::FeatureDimensionMismatch {
                expected: self.stats.dim(),
                actual: features.ncols(),
            });
        }
        Ok((features - &self.stats.mean) / &self.stats.std)
    }
}
