//! vibe-guard: vibration anomaly detection for rotating machinery.
//!
//! Raw multi-channel vibration CSVs are decimated, framed and turned into
//! log-magnitude spectra, normalized with frozen statistics and scored by a
//! per-RPM autoencoder. A sample is anomalous when its reconstruction error
//! exceeds the threshold learned from normal operation.
//!
//! ## Architecture
//!
//! - **processing**: CSV parsing, decimation, framing, spectral features, normalization
//! - **model**: frozen autoencoder, thresholds, training and on-disk bundles
//! - **drift**: KS/mean/variance drift checks and monitoring summaries
//! - **storage**: validated sample index (sled)
//! - **retrain**: per-RPM model registry and the background retrain scheduler
//! - **service** / **api**: ingestion workflow and its HTTP surface
//! - **offline**: batch dataset preparation, training and case scoring

pub mod api;
pub mod config;
pub mod drift;
pub mod model;
pub mod offline;
pub mod processing;
pub mod retrain;
pub mod service;
pub mod storage;

pub use config::GuardConfig;

pub use processing::{FeaturePipeline, FeatureStats, Normalizer, PreprocessConfig, ProcessingError, RawSignal};

pub use model::{
    AnomalyResult, ArtifactStore, BatchVerdict, FrozenAutoencoder, ModelBundle, ModelError,
    Prediction, ThresholdMethod, ThresholdRecord,
};

pub use drift::{DriftDetector, DriftReport};

pub use retrain::{ModelRegistry, RetrainJob, RetrainScheduler, TriggerDecision, TriggerReason};

pub use service::{GuardService, ServiceError};

pub use storage::{SampleRecord, SampleStore, StorageError};
