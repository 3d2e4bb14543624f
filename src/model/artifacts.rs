//! On-disk model artifacts.
//!
//! Layout:
//!
//! ```text
//! {feature_dir}/{rpm}/feature_cache.json                   geometry + FeatureStats from prepare
//! {model_dir}/model_{rpm}/VERSION                          name of the serving version
//! {model_dir}/model_{rpm}/versions/{version}/weights.json  FrozenAutoencoder
//! {model_dir}/model_{rpm}/versions/{version}/threshold.json
//! {model_dir}/model_{rpm}/versions/{version}/baseline_errors.json
//! {model_dir}/model_{rpm}/versions/{version}/feature_cache.json
//! ```
//!
//! Every file is written atomically (temp file, then rename). A version
//! directory is written in full before `VERSION` is switched to it, and
//! bundles are only ever loaded from the directory `VERSION` names. A crash
//! part way through a save leaves the previous version serving.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{FrozenAutoencoder, ModelBundle, ModelError, ThresholdRecord};
use crate::config::StorageConfig;
use crate::processing::{FeatureStats, PreprocessConfig, ProcessingError};

/// Current feature cache format.
pub const FEATURE_CACHE_VERSION: u32 = 1;

const FEATURE_CACHE_FILE: &str = "feature_cache.json";
const WEIGHTS_FILE: &str = "weights.json";
const THRESHOLD_FILE: &str = "threshold.json";
const BASELINE_FILE: &str = "baseline_errors.json";
const VERSION_FILE: &str = "VERSION";

/// Serialize `value` as pretty JSON to `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Preprocessing geometry and frozen statistics shared by training and
/// inference for one RPM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCache {
    pub format_version: u32,
    pub rpm: String,
    pub source_rate: f64,
    pub fs: f64,
    pub decim: usize,
    pub win: usize,
    pub hop: usize,
    pub channels: usize,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureCache {
    pub fn from_parts(rpm: &str, preprocess: &PreprocessConfig, stats: &FeatureStats) -> Self {
        Self {
            format_version: FEATURE_CACHE_VERSION,
            rpm: rpm.to_string(),
            source_rate: preprocess.source_rate,
            fs: preprocess.target_rate,
            decim: preprocess.decimation_factor,
            win: preprocess.window_samples,
            hop: preprocess.hop_samples,
            channels: preprocess.channels,
            mean: stats.mean.to_vec(),
            std: stats.std.to_vec(),
        }
    }

    /// Validate the version and widths, then split into geometry and stats.
    pub fn into_parts(self) -> Result<(PreprocessConfig, FeatureStats), ModelError> {
        if self.format_version != FEATURE_CACHE_VERSION {
            return Err(ModelError::SchemaMismatch {
                found: self.format_version,
                expected: FEATURE_CACHE_VERSION,
            });
        }
        let preprocess = PreprocessConfig {
            source_rate: self.source_rate,
            target_rate: self.fs,
            decimation_factor: self.decim,
            window_samples: self.win,
            hop_samples: self.hop,
            channels: self.channels,
        };
        let expected = preprocess.feature_dim();
        for actual in [self.mean.len(), self.std.len()] {
            if actual != expected {
                return Err(ProcessingError::FeatureDimensionMismatch { expected, actual }.into());
            }
        }
        Ok((
            preprocess,
            FeatureStats {
                mean: self.mean.into(),
                std: self.std.into(),
            },
        ))
    }
}

/// Filesystem store for per-RPM artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    model_dir: PathBuf,
    feature_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(model_dir: impl Into<PathBuf>, feature_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            feature_dir: feature_dir.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.model_dir, &storage.feature_dir)
    }

    pub fn model_path(&self, rpm: &str) -> PathBuf {
        self.model_dir.join(format!("model_{rpm}"))
    }

    pub fn feature_path(&self, rpm: &str) -> PathBuf {
        self.feature_dir.join(rpm)
    }

    pub fn feature_cache_path(&self, rpm: &str) -> PathBuf {
        self.feature_path(rpm).join(FEATURE_CACHE_FILE)
    }

    pub fn version_path(&self, rpm: &str, version: &str) -> PathBuf {
        self.model_path(rpm).join("versions").join(version)
    }

    pub fn has_model(&self, rpm: &str) -> bool {
        self.model_path(rpm).join(VERSION_FILE).exists()
    }

    /// The version `VERSION` points at.
    pub fn current_version(&self, rpm: &str) -> Result<String, ModelError> {
        let path = self.model_path(rpm).join(VERSION_FILE);
        let version = std::fs::read_to_string(path)
            .map_err(|e| not_found_as(e.into(), rpm))?
            .trim()
            .to_string();
        let valid = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && version != "."
            && version != "..";
        if !valid {
            return Err(ModelError::InvalidModel(format!(
                "bad VERSION pointer for RPM {rpm}: {version:?}"
            )));
        }
        Ok(version)
    }

    pub fn save_feature_cache(&self, cache: &FeatureCache) -> Result<(), ModelError> {
        write_json_atomic(&self.feature_cache_path(&cache.rpm), cache)
    }

    pub fn load_feature_cache(&self, rpm: &str) -> Result<FeatureCache, ModelError> {
        let path = self.feature_cache_path(rpm);
        read_json(&path).map_err(|e| not_found_as(e, rpm))
    }

    /// Load the serving version of `rpm` into a validated bundle.
    pub fn load_bundle(&self, rpm: &str) -> Result<ModelBundle, ModelError> {
        let version = self.current_version(rpm)?;
        self.load_version(rpm, &version)
    }

    /// Load one version directory. Every file must be present; a missing one
    /// is an invalid model rather than a missing one.
    pub fn load_version(&self, rpm: &str, version: &str) -> Result<ModelBundle, ModelError> {
        let dir = self.version_path(rpm, version);
        let incomplete = |e: ModelError| match e {
            ModelError::Io(io) if io.kind() == io::ErrorKind::NotFound => ModelError::InvalidModel(
                format!("version {version} of RPM {rpm} is incomplete: {io}"),
            ),
            other => other,
        };

        let network: FrozenAutoencoder = read_json(&dir.join(WEIGHTS_FILE)).map_err(incomplete)?;
        // Deserialization bypasses the shape checks in `new`.
        let network = FrozenAutoencoder::new(network.layers().to_vec())?;
        let threshold: ThresholdRecord = read_json(&dir.join(THRESHOLD_FILE)).map_err(incomplete)?;
        let baseline_errors: Vec<f64> = read_json(&dir.join(BASELINE_FILE)).map_err(incomplete)?;
        let cache: FeatureCache = read_json(&dir.join(FEATURE_CACHE_FILE)).map_err(incomplete)?;
        let (preprocess, stats) = cache.into_parts()?;

        debug!(rpm, version, "Loaded model bundle from disk");
        ModelBundle::new(rpm, version, preprocess, stats, network, threshold, baseline_errors)
    }

    /// Persist `bundle` as a new version, then point `VERSION` at it.
    ///
    /// Returns the version directory.
    pub fn save_versioned(&self, bundle: &ModelBundle) -> Result<PathBuf, ModelError> {
        let rpm = bundle.rpm();
        let version_dir = self.version_path(rpm, bundle.version());
        let cache = FeatureCache::from_parts(rpm, bundle.preprocess(), bundle.stats());

        write_json_atomic(&version_dir.join(WEIGHTS_FILE), bundle.network())?;
        write_json_atomic(&version_dir.join(THRESHOLD_FILE), bundle.threshold())?;
        write_json_atomic(&version_dir.join(BASELINE_FILE), &bundle.baseline_errors())?;
        write_json_atomic(&version_dir.join(FEATURE_CACHE_FILE), &cache)?;

        // Promote: the pointer switch is the commit point.
        write_text_atomic(&self.model_path(rpm).join(VERSION_FILE), bundle.version())?;
        // Keep the prepare cache in step for offline tooling.
        self.save_feature_cache(&cache)?;

        info!(
            rpm,
            version = bundle.version(),
            path = %version_dir.display(),
            "Promoted new model version"
        );
        Ok(version_dir)
    }

    /// Version directories of `rpm`, oldest first.
    pub fn list_versions(&self, rpm: &str) -> Result<Vec<String>, ModelError> {
        let dir = self.model_path(rpm).join("versions");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        Ok(versions)
    }
}

fn write_text_atomic(path: &Path, text: &str) -> Result<(), ModelError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, text)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn not_found_as(err: ModelError, rpm: &str) -> ModelError {
    match err {
        ModelError::Io(e) if e.kind() == io::ErrorKind::NotFound => ModelError::NotFound {
            rpm: rpm.to_string(),
        },
        other => other,
    }
}
