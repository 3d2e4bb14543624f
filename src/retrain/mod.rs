//! Retraining: per-RPM model registry, trigger evaluation and the
//! background retrain worker.
//!
//! ## Architecture
//!
//! ```text
//! validated ingest ──► RetrainScheduler::on_validated_ingest
//!                        │  count % interval == 0 ?
//!                        │  DriftDetector (variance ∧ tcr ∧ KS) ?
//!                        ▼
//!                  single-flight guard (per RPM)
//!                        │
//!                        ▼
//!            spawn_blocking(RetrainJob::build) under timeout
//!                        │ Ok
//!                        ▼
//!         ArtifactStore::save_versioned ─► ModelRegistry::install (swap)
//! ```
//!
//! Every RPM owns an independent [`registry::RpmSlot`]; nothing here takes
//! a lock shared between operating points.

mod job;
mod registry;
mod scheduler;

pub use job::{new_version, RetrainJob, StoredSampleRetrainer};
pub use registry::{ModelRegistry, RpmSlot};
pub use scheduler::{RetrainOutcome, RetrainScheduler, RetrainStatus, TriggerDecision, TriggerReason};

use thiserror::Error;

use crate::model::ModelError;
use crate::processing::ProcessingError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RetrainError {
    #[error("Retrain already in progress for RPM {rpm}")]
    InProgress { rpm: String },

    #[error("Retrain for RPM {rpm} timed out after {secs}s")]
    TimedOut { rpm: String, secs: u64 },

    #[error("Not enough stored samples for RPM {rpm}: have {have}, need {need}")]
    InsufficientSamples { rpm: String, have: usize, need: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("Retrain task failed: {0}")]
    Join(String),
}
