//! Model module - per-RPM autoencoder bundles
//!
//! ## Architecture
//! - `network`: dense autoencoder (ReLU hidden layers, identity output) and
//!   per-window reconstruction error
//! - `threshold`: percentile threshold derivation and batch verdicts
//! - `training`: mini-batch Adam fitting with early stopping
//! - `bundle`: the immutable unit served for one RPM (geometry, stats,
//!   weights, threshold, baseline errors)
//! - `artifacts`: on-disk layout, format versioning and atomic writes

mod artifacts;
mod bundle;
mod network;
mod threshold;
mod training;

pub use artifacts::{
    read_json, write_json_atomic, ArtifactStore, FeatureCache, FEATURE_CACHE_VERSION,
};
pub use bundle::{AnomalyResult, ModelBundle, Prediction};
pub use network::{Activation, DenseLayer, FrozenAutoencoder};
pub use threshold::{derive_threshold, is_anomaly, percentile, BatchVerdict, ThresholdMethod, ThresholdRecord};
pub use training::{AdamTrainer, TrainingOutcome};

#[cfg(test)]
pub(crate) use bundle::test_support;

use thiserror::Error;

use crate::processing::ProcessingError;

/// Errors in model loading, training and scoring
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("No model artifacts for RPM {rpm}")]
    NotFound { rpm: String },

    #[error("Insufficient training data: have {have} windows, need at least {need}")]
    InsufficientTrainingData { have: usize, need: usize },

    #[error("Training diverged: {0}")]
    TrainingDiverged(String),

    #[error("Training cancelled")]
    Cancelled,

    #[error("Unsupported artifact format version {found} (expected {expected})")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModelError {
    /// Whether this is a feature width disagreement between stored
    /// statistics and the extracted features.
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Processing(ProcessingError::FeatureDimensionMismatch { .. })
        )
    }
}
