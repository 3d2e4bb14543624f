//! Train the initial bundle of one RPM from its prepared dataset.

use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::prepare::load_dataset;
use super::OfflineError;
use crate::config::GuardConfig;
use crate::model::{derive_threshold, AdamTrainer, ArtifactStore, ModelBundle, ModelError};
use crate::retrain::new_version;

#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub rpm: String,
    pub version: String,
    pub train_cases: Vec<u32>,
    pub train_windows: usize,
    pub epochs: usize,
    pub converged: bool,
    pub final_loss: f64,
    pub threshold_method: String,
    pub threshold: f64,
    pub baseline_windows: usize,
    pub version_dir: PathBuf,
}

/// Fit on the normal cases, derive the threshold from their errors and
/// keep the errors of every dataset row as the drift baseline.
pub fn train(
    rpm: &str,
    config: &GuardConfig,
    artifacts: &ArtifactStore,
    cancel: &CancellationToken,
) -> Result<TrainSummary, OfflineError> {
    let dataset = load_dataset(artifacts, rpm)?;
    let (preprocess, stats) = artifacts.load_feature_cache(rpm)?.into_parts()?;

    let train_cases = &config.training.normal_case_ids;
    let x_train = dataset.select_cases(train_cases);
    let need = config.training.min_training_windows;
    if x_train.nrows() < need {
        return Err(ModelError::InsufficientTrainingData {
            have: x_train.nrows(),
            need,
        }
        .into());
    }

    info!(
        rpm,
        cases = ?train_cases,
        windows = x_train.nrows(),
        hidden = ?config.training.hidden_layers,
        "Training autoencoder"
    );
    let outcome = AdamTrainer::new(config.training.clone()).fit(&x_train, cancel)?;
    let train_errors = outcome.network.reconstruction_errors(&x_train)?.to_vec();
    let threshold = derive_threshold(rpm, &train_errors, config.threshold.method, train_cases)?;
    let baseline = outcome.network.reconstruction_errors(&dataset.features)?.to_vec();

    let summary = TrainSummary {
        rpm: rpm.to_string(),
        version: new_version(),
        train_cases: train_cases.clone(),
        train_windows: x_train.nrows(),
        epochs: outcome.epochs,
        converged: outcome.converged,
        final_loss: outcome.final_loss,
        threshold_method: threshold.threshold_method.clone(),
        threshold: threshold.threshold,
        baseline_windows: baseline.len(),
        version_dir: PathBuf::new(),
    };

    let bundle = ModelBundle::new(
        rpm,
        summary.version.clone(),
        preprocess,
        stats,
        outcome.network,
        threshold,
        baseline,
    )?;
    let version_dir = artifacts.save_versioned(&bundle)?;

    info!(
        rpm,
        version = %summary.version,
        threshold = summary.threshold,
        epochs = summary.epochs,
        "Model trained"
    );
    Ok(TrainSummary {
        version_dir,
        ..summary
    })
}
