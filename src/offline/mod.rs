//! Offline batch tooling: dataset preparation, training and per-case scoring.
//!
//! ```text
//! raw_dir/Case*/…/*.csv ─► prepare ─► {feature_dir}/{rpm}/dataset.json + meta.json
//!                                     {feature_dir}/{rpm}/feature_cache.json
//!                          train   ─► {model_dir}/model_{rpm}/…
//!                          score   ─► scores_by_case.csv
//! ```
//!
//! A bad input file is recorded and skipped; it never aborts the batch.

mod prepare;
mod score;
mod train;

pub use prepare::{
    case_id_from_path, discover_case_files, load_dataset, prepare, CaseFile, PrepareSummary,
    PreparedDataset, SkippedFile,
};
pub use score::{score_cases, write_case_scores_csv, CaseScore};
pub use train::{train, TrainSummary};

use std::path::PathBuf;
use thiserror::Error;

use crate::model::ModelError;
use crate::processing::ProcessingError;

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error("No CSV files found under {0}")]
    NoInputs(PathBuf),

    #[error("No usable windows in any input file ({skipped} skipped)")]
    NoUsableWindows { skipped: usize },

    #[error("Dataset for RPM {rpm} not prepared at {path}")]
    DatasetMissing { rpm: String, path: PathBuf },

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
