//! The per-RPM model bundle.
//!
//! A bundle is immutable once built. Replacing one is done by swapping the
//! whole `Arc<ModelBundle>` handle in the registry, never by mutating fields.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::threshold::{is_anomaly, BatchVerdict, ThresholdRecord};
use super::{FrozenAutoencoder, ModelError};
use crate::processing::{
    FeaturePipeline, FeatureStats, Normalizer, PreprocessConfig, ProcessingError, RawSignal,
};

/// Per-window scoring result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub window_index: usize,
    pub error: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
}

/// All window results of one input plus the batch-level verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub results: Vec<AnomalyResult>,
    pub verdict: BatchVerdict,
}

impl Prediction {
    pub fn errors(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.error).collect()
    }
}

/// Preprocessing geometry, feature statistics, weights, threshold and
/// baseline error sample for one RPM, versioned and swapped as a unit.
#[derive(Debug)]
pub struct ModelBundle {
    rpm: String,
    version: String,
    preprocess: PreprocessConfig,
    normalizer: Normalizer,
    network: FrozenAutoencoder,
    threshold: ThresholdRecord,
    baseline_errors: Arc<[f64]>,
    pipeline: FeaturePipeline,
}

impl ModelBundle {
    /// Assemble a bundle, refusing any width disagreement between the
    /// geometry, the stored statistics and the network.
    pub fn new(
        rpm: impl Into<String>,
        version: impl Into<String>,
        preprocess: PreprocessConfig,
        stats: FeatureStats,
        network: FrozenAutoencoder,
        threshold: ThresholdRecord,
        baseline_errors: Vec<f64>,
    ) -> Result<Self, ModelError> {
        let expected = preprocess.feature_dim();
        if stats.dim() != expected {
            return Err(ProcessingError::FeatureDimensionMismatch {
                expected,
                actual: stats.dim(),
            }
            .into());
        }
        if network.input_dim() != expected {
            return Err(ProcessingError::FeatureDimensionMismatch {
                expected,
                actual: network.input_dim(),
            }
            .into());
        }

        Ok(Self {
            rpm: rpm.into(),
            version: version.into(),
            pipeline: FeaturePipeline::new(preprocess)?,
            preprocess,
            normalizer: Normalizer::from_stats(stats)?,
            network,
            threshold,
            baseline_errors: baseline_errors.into(),
        })
    }

    pub fn rpm(&self) -> &str {
        &self.rpm
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn preprocess(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    pub fn stats(&self) -> &FeatureStats {
        self.normalizer.stats()
    }

    pub fn network(&self) -> &FrozenAutoencoder {
        &self.network
    }

    pub fn threshold(&self) -> &ThresholdRecord {
        &self.threshold
    }

    pub fn threshold_value(&self) -> f64 {
        self.threshold.threshold
    }

    pub fn baseline_errors(&self) -> &[f64] {
        &self.baseline_errors
    }

    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    /// Per-window reconstruction errors for un-normalized features.
    pub fn score_features(&self, features: &Array2<f64>) -> Result<Vec<f64>, ModelError> {
        let normalized = self.normalizer.transform(features)?;
        Ok(self.network.reconstruction_errors(&normalized)?.to_vec())
    }

    /// Full inference path: raw signal → features → per-window results.
    pub fn predict(&self, signal: &RawSignal) -> Result<Prediction, ModelError> {
        let features = self.pipeline.extract(signal)?;
        let errors = self.score_features(&features)?;
        let threshold = self.threshold.threshold;

        let results = errors
            .iter()
            .enumerate()
            .map(|(window_index, &error)| AnomalyResult {
                window_index,
                error,
                threshold,
                is_anomaly: is_anomaly(error, threshold),
            })
            .collect();
        let verdict = BatchVerdict::from_errors(&errors, threshold)
            .ok_or_else(|| ModelError::InvalidModel("no windows were scored".to_string()))?;

        Ok(Prediction { results, verdict })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::{derive_threshold, ThresholdMethod};
    use ndarray::Array1;

    /// Small single-channel geometry: 1 kHz, no decimation, 16-sample windows.
    pub fn tiny_preprocess() -> PreprocessConfig {
        PreprocessConfig {
            source_rate: 1_000.0,
            target_rate: 1_000.0,
            decimation_factor: 1,
            window_samples: 16,
            hop_samples: 8,
            channels: 1,
        }
    }

    pub fn tiny_bundle(rpm: &str, threshold: f64) -> Result<ModelBundle, ModelError> {
        tiny_bundle_version(rpm, "v-test", threshold)
    }

    pub fn tiny_bundle_version(
        rpm: &str,
        version: &str,
        threshold: f64,
    ) -> Result<ModelBundle, ModelError> {
        let preprocess = tiny_preprocess();
        let dim = preprocess.feature_dim();
        let stats = FeatureStats {
            mean: Array1::zeros(dim),
            std: Array1::ones(dim),
        };
        let network = FrozenAutoencoder::initialize(dim, &[4], 1)?;
        let mut record = derive_threshold(rpm, &[threshold], ThresholdMethod::P95, &[0])?;
        record.threshold = threshold;
        ModelBundle::new(rpm, version, preprocess, stats, network, record, vec![0.1; 20])
    }
}
