//! Guard service: the operations behind the HTTP surface.
//!
//! Ingest flow:
//!
//! ```text
//! CSV bytes ─► parse ─► bundle.predict ─► mean gate ─┬─ rejected: results only
//!                                                    └─ validated: copy file,
//!                                                       record sample, push error,
//!                                                       RetrainScheduler trigger
//! ```
//!
//! CPU and disk work runs on the blocking pool; the async side only joins
//! results and talks to the scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::drift::{analyze, DriftDetector, DriftMetrics, ErrorObservation, HistogramBin};
use crate::model::{AnomalyResult, ArtifactStore, BatchVerdict, ModelError, Prediction};
use crate::processing::{parse_signal_csv, ProcessingError};
use crate::retrain::{
    ModelRegistry, RetrainError, RetrainJob, RetrainOutcome, RetrainScheduler,
    StoredSampleRetrainer, TriggerDecision, TriggerReason,
};
use crate::storage::{SampleRecord, SampleStore, StorageError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Unsupported RPM: {0}")]
    UnsupportedRpm(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Retrain already in progress for RPM {0}")]
    RetrainInProgress(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Model(ModelError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for ServiceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotFound { rpm } => Self::UnsupportedRpm(rpm),
            ModelError::Processing(inner) => Self::Processing(inner),
            other => Self::Model(other),
        }
    }
}

impl ServiceError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnsupportedRpm(_) => "UNSUPPORTED_RPM",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RetrainInProgress(_) => "RETRAIN_IN_PROGRESS",
            Self::Processing(ProcessingError::FeatureDimensionMismatch { .. }) => {
                "FEATURE_DIMENSION_MISMATCH"
            }
            Self::Processing(
                ProcessingError::InsufficientData { .. } | ProcessingError::InsufficientLength { .. },
            ) => "INSUFFICIENT_DATA",
            Self::Processing(ProcessingError::MalformedCsv(_)) => "MALFORMED_CSV",
            Self::Processing(ProcessingError::ChannelMismatch { .. }) => "CHANNEL_MISMATCH",
            Self::Processing(_) => "PROCESSING_ERROR",
            Self::Model(_) => "MODEL_ERROR",
            Self::Storage(_) | Self::Io(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub rpm: String,
    pub user_id: u64,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub is_saved: bool,
    pub rpm: String,
    pub mean_diff: f64,
    pub data: Vec<AnomalyResult>,
    pub verdict: BatchVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrain: Option<TriggerDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestAnalysis {
    pub rpm: String,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: DriftMetrics,
    #[serde(rename = "chartData")]
    pub chart_data: Vec<HistogramBin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retrain: Option<RetrainOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub sha256: String,
    pub deleted: usize,
    pub files_removed: usize,
}

/// Result of the blocking half of an ingest.
struct Scored {
    prediction: Prediction,
    mean_diff: f64,
    /// Version of the bundle that scored the upload
    scored_by: String,
    saved: Option<SampleRecord>,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct GuardService {
    config: Arc<GuardConfig>,
    registry: Arc<ModelRegistry>,
    scheduler: Arc<RetrainScheduler>,
    store: SampleStore,
}

impl std::fmt::Debug for GuardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardService")
            .field("rpms", &self.config.rpm.operating_points)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl GuardService {
    /// Open the sample database and wire the default stored-sample retrainer.
    pub fn open(config: GuardConfig) -> Result<Self, ServiceError> {
        let store = SampleStore::open(&config.storage.db_path)?;
        let job = Arc::new(StoredSampleRetrainer::new(store.clone(), config.clone()));
        Self::new(config, store, job)
    }

    pub fn new(
        config: GuardConfig,
        store: SampleStore,
        job: Arc<dyn RetrainJob>,
    ) -> Result<Self, ServiceError> {
        let registry = Arc::new(ModelRegistry::new(
            ArtifactStore::from_config(&config.storage),
            config.drift.window_size,
        ));
        let scheduler = Arc::new(RetrainScheduler::new(
            Arc::clone(&registry),
            job,
            DriftDetector::new(config.drift.clone()),
            &config.retrain,
        ));

        let service = Self {
            config: Arc::new(config),
            registry,
            scheduler,
            store,
        };
        service.restore_state()?;
        Ok(service)
    }

    /// Rebuild per-RPM counts and drift windows from stored samples.
    fn restore_state(&self) -> Result<(), ServiceError> {
        for rpm in &self.config.rpm.operating_points {
            let count = self.store.count(rpm) as u64;
            let history = self
                .store
                .recent(rpm, self.config.drift.window_size)?
                .into_iter()
                .map(|r| ErrorObservation {
                    error: r.error_val,
                    observed_at: r.created_at,
                    sample: Some(r.sha256),
                    scored_by: None,
                })
                .collect();
            self.registry.seed(rpm, count, history);
            if let Err(e) = self.registry.get(rpm) {
                warn!(rpm = %rpm, error = %e, "No model available at startup");
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<RetrainScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Score an upload, persist it when it passes the mean gate, and feed the
    /// retrain triggers.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse, ServiceError> {
        self.operating_point(&request.rpm)?;
        if !has_csv_extension(&request.filename) {
            return Err(ServiceError::InvalidInput(
                "Only CSV files are supported".to_string(),
            ));
        }

        let this = self.clone();
        let rpm = request.rpm.clone();
        let scored = tokio::task::spawn_blocking(move || this.score_and_store(request))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;

        let retrain = scored.saved.as_ref().map(|record| {
            let observation = ErrorObservation {
                error: record.error_val,
                observed_at: record.created_at,
                sample: Some(record.sha256.clone()),
                scored_by: Some(scored.scored_by.clone()),
            };
            self.scheduler.on_validated_ingest(&rpm, observation)
        });

        Ok(IngestResponse {
            status: "success",
            is_saved: scored.saved.is_some(),
            rpm,
            mean_diff: round4(scored.mean_diff),
            data: scored.prediction.results,
            verdict: scored.prediction.verdict,
            retrain,
        })
    }

    /// Inference only: nothing is stored and no trigger is evaluated.
    pub fn predict(&self, rpm: &str, bytes: &[u8]) -> Result<Prediction, ServiceError> {
        self.operating_point(rpm)?;
        let bundle = self.registry.get(rpm)?;
        let preprocess = bundle.preprocess();
        let signal = parse_signal_csv(bytes, preprocess.channels, preprocess.source_rate)?;
        Ok(bundle.predict(&signal)?)
    }

    fn score_and_store(&self, request: IngestRequest) -> Result<Scored, ServiceError> {
        let IngestRequest {
            rpm,
            user_id,
            filename,
            bytes,
        } = request;

        let bundle = self.registry.get(&rpm)?;
        let preprocess = bundle.preprocess();
        let signal = parse_signal_csv(&bytes, preprocess.channels, preprocess.source_rate)?;
        let prediction = bundle.predict(&signal)?;

        let current_mean = signal
            .channel_mean(0)
            .ok_or_else(|| ServiceError::InvalidInput("empty signal".to_string()))?;
        let reference_mean = self
            .store
            .latest(&rpm)?
            .map_or(current_mean, |r| r.mean_val);
        let mean_diff = (current_mean - reference_mean).abs();
        let limit = self.config.ingest.mean_diff_limit;

        if mean_diff >= limit {
            info!(
                rpm = %rpm,
                mean_diff,
                limit,
                "Upload failed mean validation, not stored"
            );
            return Ok(Scored {
                prediction,
                mean_diff,
                scored_by: bundle.version().to_string(),
                saved: None,
            });
        }

        let sha256 = hex::encode(Sha256::digest(&bytes));
        let created_at = Utc::now();
        let storage_path = self.validated_path(&rpm, &filename, created_at);
        if let Some(parent) = storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&storage_path, &bytes)?;

        let record = SampleRecord {
            user_id,
            rpm: rpm.clone(),
            original_filename: filename,
            storage_path,
            file_size_bytes: bytes.len() as u64,
            sha256,
            row_count: signal.len(),
            mean_val: current_mean,
            error_val: prediction.verdict.err_p95,
            created_at,
        };
        self.store.insert(&record)?;
        debug!(
            rpm = %rpm,
            sha256 = %record.sha256,
            error = record.error_val,
            windows = prediction.verdict.windows,
            "Validated sample stored"
        );

        Ok(Scored {
            prediction,
            mean_diff,
            scored_by: bundle.version().to_string(),
            saved: Some(record),
        })
    }

    fn validated_path(&self, rpm: &str, filename: &str, at: DateTime<Utc>) -> PathBuf {
        self.config
            .storage
            .validated_dir
            .join(rpm)
            .join(format!("{}_{}", at.format("%Y%m%d_%H%M%S_%6f"), sanitize_filename(filename)))
    }

    /// Drift metrics and histogram for the most recent stored sample.
    pub fn latest_analysis(&self) -> Result<LatestAnalysis, ServiceError> {
        let latest = self
            .store
            .latest_any()?
            .ok_or_else(|| ServiceError::NotFound("No samples stored yet".to_string()))?;
        let bundle = self.registry.get(&latest.rpm)?;
        let recent: Vec<f64> = self
            .store
            .recent(&latest.rpm, self.config.drift.window_size)?
            .iter()
            .map(|r| r.error_val)
            .collect();

        let snapshot = analyze(
            &recent,
            bundle.baseline_errors(),
            bundle.threshold_value(),
            latest.error_val,
            self.config.drift.histogram_bins,
        );

        Ok(LatestAnalysis {
            last_retrain: self.scheduler.last_outcome(&latest.rpm),
            rpm: latest.rpm,
            filename: latest.original_filename,
            timestamp: latest.created_at,
            metrics: snapshot.metrics,
            chart_data: snapshot.chart_data,
        })
    }

    /// Start a retrain for `rpm` outside the automatic triggers.
    pub fn request_retrain(&self, rpm: &str) -> Result<(), ServiceError> {
        self.operating_point(rpm)?;
        match self.scheduler.request(rpm, TriggerReason::Manual) {
            Ok(_) => Ok(()),
            Err(RetrainError::InProgress { rpm }) => Err(ServiceError::RetrainInProgress(rpm)),
            Err(e) => Err(ServiceError::Internal(e.to_string())),
        }
    }

    /// Only configured operating points are served; anything else is
    /// rejected before it reaches the registry.
    fn operating_point(&self, rpm: &str) -> Result<(), ServiceError> {
        validate_rpm(rpm)?;
        if self.config.rpm.operating_points.iter().any(|p| p == rpm) {
            Ok(())
        } else {
            Err(ServiceError::UnsupportedRpm(rpm.to_string()))
        }
    }

    /// Delete every stored sample with content hash `sha256`, including the
    /// copied CSV files and its error in the drift window.
    pub fn delete_sample(&self, sha256: &str) -> Result<DeleteOutcome, ServiceError> {
        let sha256 = sha256.trim().to_ascii_lowercase();
        if sha256.is_empty() || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ServiceError::InvalidInput(
                "sha256 must be a hex digest".to_string(),
            ));
        }

        let removed = self.store.delete_by_hash(&sha256)?;
        if removed.is_empty() {
            return Err(ServiceError::NotFound(format!("No sample with sha256 {sha256}")));
        }

        let mut files_removed = 0;
        for record in &removed {
            self.registry.decrement_count(&record.rpm, 1);
            self.registry.forget_sample(&record.rpm, &record.sha256);
            match std::fs::remove_file(&record.storage_path) {
                Ok(()) => files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %record.storage_path.display(),
                    error = %e,
                    "Could not remove stored sample file"
                ),
            }
        }
        self.store.flush()?;

        info!(sha256 = %sha256, deleted = removed.len(), files_removed, "Sample deleted");
        Ok(DeleteOutcome {
            sha256,
            deleted: removed.len(),
            files_removed,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// RPM labels double as directory names, so only `[A-Za-z0-9_-]` is allowed.
fn validate_rpm(rpm: &str) -> Result<(), ServiceError> {
    let valid = !rpm.is_empty()
        && rpm.len() <= 32
        && rpm
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput(format!("Invalid RPM label: {rpm:?}")))
    }
}

fn has_csv_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map_or_else(|| "upload.csv".into(), |n| n.to_string_lossy());
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
