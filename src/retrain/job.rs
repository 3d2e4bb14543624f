//! The retrain job: rebuild a complete bundle for one RPM.

use chrono::Utc;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::RetrainError;
use crate::config::GuardConfig;
use crate::model::{derive_threshold, AdamTrainer, ModelBundle, ModelError};
use crate::processing::{read_signal_csv, FeaturePipeline, Normalizer, PreprocessConfig};
use crate::storage::SampleStore;

/// Builds a replacement bundle. Runs on a blocking thread and should check
/// `cancel` between expensive steps.
pub trait RetrainJob: Send + Sync + 'static {
    fn build(
        &self,
        rpm: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelBundle, RetrainError>;
}

/// Version label for a bundle built now, e.g. `v20260101T120000123`.
pub fn new_version() -> String {
    Utc::now().format("v%Y%m%dT%H%M%S%3f").to_string()
}

/// Retrains from every validated sample stored for the RPM.
#[derive(Debug, Clone)]
pub struct StoredSampleRetrainer {
    store: SampleStore,
    config: GuardConfig,
}

impl StoredSampleRetrainer {
    pub fn new(store: SampleStore, config: GuardConfig) -> Self {
        Self { store, config }
    }

    fn collect_features(
        &self,
        rpm: &str,
        pipeline: &FeaturePipeline,
        cancel: &CancellationToken,
    ) -> Result<(Array2<f64>, usize), RetrainError> {
        let records = self.store.list(rpm)?;
        let need = self.config.retrain.min_files;
        if records.len() < need {
            return Err(RetrainError::InsufficientSamples {
                rpm: rpm.to_string(),
                have: records.len(),
                need,
            });
        }

        let preprocess = pipeline.config();
        let mut blocks = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in &records {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled.into());
            }
            let features = read_signal_csv(
                &record.storage_path,
                preprocess.channels,
                preprocess.source_rate,
            )
            .and_then(|signal| pipeline.extract(&signal));
            match features {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    skipped += 1;
                    let reason = e.skip_reason();
                    warn!(
                        rpm,
                        path = %record.storage_path.display(),
                        reason = %reason,
                        "Skipping stored sample during retrain"
                    );
                }
            }
        }

        let views: Vec<ArrayView2<f64>> = blocks.iter().map(Array2::view).collect();
        if views.is_empty() {
            return Err(ModelError::InsufficientTrainingData { have: 0, need: 1 }.into());
        }
        let x = concatenate(Axis(0), &views)
            .map_err(|e| ModelError::InvalidModel(format!("feature blocks disagree: {e}")))?;
        Ok((x, skipped))
    }
}

impl RetrainJob for StoredSampleRetrainer {
    fn build(
        &self,
        rpm: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelBundle, RetrainError> {
        let settings = self.config.preprocess_for(rpm);
        let preprocess = PreprocessConfig::from_settings(settings)?;
        let pipeline =
            FeaturePipeline::new(preprocess)?.with_max_windows(settings.max_windows_per_file);

        let (features, skipped) = self.collect_features(rpm, &pipeline, cancel)?;
        let normalizer = Normalizer::fit(&features)?;
        let x = normalizer.transform(&features)?;

        let outcome = AdamTrainer::new(self.config.training.clone()).fit(&x, cancel)?;
        let errors = outcome.network.reconstruction_errors(&x)?.to_vec();
        let threshold = derive_threshold(rpm, &errors, self.config.threshold.method, &[])?;

        info!(
            rpm,
            version,
            windows = x.nrows(),
            skipped,
            epochs = outcome.epochs,
            final_loss = outcome.final_loss,
            threshold = threshold.threshold,
            "Retrain produced new bundle"
        );

        Ok(ModelBundle::new(
            rpm,
            version,
            preprocess,
            normalizer.into_stats(),
            outcome.network,
            threshold,
            errors,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PreprocessSettings, StorageConfig};
    use crate::storage::SampleRecord;
    use std::path::Path;

    fn tiny_config(root: &Path) -> GuardConfig {
        let mut config = GuardConfig::default();
        config.preprocess = PreprocessSettings {
            source_rate_hz: 1_000.0,
            target_rate_hz: 1_000.0,
            window_seconds: 0.016,
            hop_seconds: 0.008,
            decimate: false,
            channels: 1,
            max_windows_per_file: None,
        };
        config.training.hidden_layers = vec![4];
        config.training.epochs = 20;
        config.training.batch_size = 16;
        config.retrain.min_files = 2;
        config.storage = StorageConfig::rooted_at(root);
        config
    }

    fn store_sample(store: &SampleStore, root: &Path, rpm: &str, idx: usize, samples: usize) {
        let path = root.join(format!("{rpm}_{idx}.csv"));
        let body: String = (0..samples)
            .map(|i| format!("{}\n", ((i + idx) as f64 * 0.37).sin()))
            .collect();
        std::fs::write(&path, &body).expect("write csv");
        store
            .insert(&SampleRecord {
                user_id: 1,
                rpm: rpm.to_string(),
                original_filename: format!("{idx}.csv"),
                storage_path: path,
                file_size_bytes: body.len() as u64,
                sha256: format!("hash{idx}"),
                row_count: samples,
                mean_val: 0.0,
                error_val: 0.1,
                created_at: Utc::now() + chrono::Duration::milliseconds(idx as i64),
            })
            .expect("insert");
    }

    #[test]
    fn test_build_from_stored_samples() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = SampleStore::open_temporary().expect("store");
        for idx in 0..3 {
            store_sample(&store, dir.path(), "800", idx, 256);
        }
        // Too short for one window: skipped, not fatal.
        store_sample(&store, dir.path(), "800", 3, 8);

        let job = StoredSampleRetrainer::new(store, tiny_config(dir.path()));
        let bundle = job
            .build("800", "v-next", &CancellationToken::new())
            .expect("build");
        assert_eq!(bundle.rpm(), "800");
        assert_eq!(bundle.version(), "v-next");
        assert_eq!(bundle.preprocess().feature_dim(), 9);
        // 3 files × 31 windows each
        assert_eq!(bundle.baseline_errors().len(), 93);
        assert!(bundle.threshold_value() > 0.0);
    }

    #[test]
    fn test_too_few_files_is_reported() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = SampleStore::open_temporary().expect("store");
        store_sample(&store, dir.path(), "800", 0, 256);

        let job = StoredSampleRetrainer::new(store, tiny_config(dir.path()));
        let err = job
            .build("800", "v-next", &CancellationToken::new())
            .expect_err("too few");
        assert!(matches!(
            err,
            RetrainError::InsufficientSamples { have: 1, need: 2, .. }
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = SampleStore::open_temporary().expect("store");
        for idx in 0..2 {
            store_sample(&store, dir.path(), "800", idx, 256);
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = StoredSampleRetrainer::new(store, tiny_config(dir.path()));
        let err = job.build("800", "v", &cancel).expect_err("cancelled");
        assert!(matches!(err, RetrainError::Model(ModelError::Cancelled)));
    }

    #[test]
    fn test_version_labels_sort_by_time() {
        let a = new_version();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_version();
        assert!(a.starts_with('v'));
        assert!(a < b);
    }
}
