//! Guard Configuration - operator-tunable TOML values
//!
//! Every tuning constant of the pipeline is a field in this module. Each
//! struct implements `Default` with values matching [`super::defaults`],
//! ensuring identical behavior when no config file is present.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::model::ThresholdMethod;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a guard deployment.
///
/// Load with `GuardConfig::load()` which searches:
/// 1. `$VIBE_GUARD_CONFIG` env var
/// 2. `./vibe_guard.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Default signal preprocessing geometry
    #[serde(default)]
    pub preprocess: PreprocessSettings,

    /// RPM operating points and per-RPM overrides
    #[serde(default)]
    pub rpm: RpmConfig,

    /// Threshold derivation policy
    #[serde(default)]
    pub threshold: ThresholdConfig,

    /// Autoencoder training hyperparameters
    #[serde(default)]
    pub training: TrainingConfig,

    /// Drift detector limits
    #[serde(default)]
    pub drift: DriftConfig,

    /// Retraining cadence
    #[serde(default)]
    pub retrain: RetrainConfig,

    /// Upload validation gate
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Artifact and database locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl GuardConfig {
    /// Load configuration using the standard search order:
    /// 1. `$VIBE_GUARD_CONFIG` environment variable
    /// 2. `./vibe_guard.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("VIBE_GUARD_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded guard config from VIBE_GUARD_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from VIBE_GUARD_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "VIBE_GUARD_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("vibe_guard.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded guard config from ./vibe_guard.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./vibe_guard.toml, using defaults");
                }
            }
        }

        info!("No vibe_guard.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Preprocessing settings for one RPM: the per-RPM override if present,
    /// otherwise the global defaults.
    pub fn preprocess_for(&self, rpm: &str) -> &PreprocessSettings {
        self.rpm.overrides.get(rpm).unwrap_or(&self.preprocess)
    }

    /// Validate all values for internal consistency.
    ///
    /// Rules:
    /// - Rates, window and hop lengths must be positive and finite
    /// - Drift limits must be finite; fractions within (0, 1)
    /// - Counts and sizes must be > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        Self::check_preprocess("preprocess", &self.preprocess, &mut errors);
        for (rpm, settings) in &self.rpm.overrides {
            Self::check_preprocess(&format!("rpm.overrides.{rpm}"), settings, &mut errors);
        }

        if self.rpm.operating_points.is_empty() {
            errors.push("rpm.operating_points must not be empty".to_string());
        }

        let t = &self.training;
        if t.hidden_layers.is_empty() || t.hidden_layers.contains(&0) {
            errors.push("training.hidden_layers must be non-empty with sizes > 0".to_string());
        }
        if t.epochs == 0 {
            errors.push("training.epochs must be > 0".to_string());
        }
        if t.batch_size == 0 {
            errors.push("training.batch_size must be > 0".to_string());
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            errors.push(format!(
                "training.learning_rate must be a positive finite number (got {})",
                t.learning_rate
            ));
        }
        if t.min_training_windows == 0 {
            errors.push("training.min_training_windows must be > 0".to_string());
        }

        let d = &self.drift;
        if d.window_size == 0 {
            errors.push("drift.window_size must be > 0".to_string());
        }
        if !d.variance_limit.is_finite() || d.variance_limit < 0.0 {
            errors.push(format!(
                "drift.variance_limit must be finite and >= 0 (got {})",
                d.variance_limit
            ));
        }
        for (name, value) in [("tcr_limit", d.tcr_limit), ("ks_alpha", d.ks_alpha)] {
            if !(value > 0.0 && value < 1.0) {
                errors.push(format!("drift.{name} must be within (0, 1) (got {value})"));
            }
        }
        if d.histogram_bins == 0 {
            errors.push("drift.histogram_bins must be > 0".to_string());
        }

        if self.retrain.count_interval == 0 {
            errors.push("retrain.count_interval must be > 0".to_string());
        }
        if self.retrain.timeout_secs == 0 {
            errors.push("retrain.timeout_secs must be > 0".to_string());
        }

        if !self.ingest.mean_diff_limit.is_finite() || self.ingest.mean_diff_limit <= 0.0 {
            errors.push(format!(
                "ingest.mean_diff_limit must be a positive finite number (got {})",
                self.ingest.mean_diff_limit
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_preprocess(name: &str, p: &PreprocessSettings, errors: &mut Vec<String>) {
        for (field, value) in [
            ("source_rate_hz", p.source_rate_hz),
            ("target_rate_hz", p.target_rate_hz),
            ("window_seconds", p.window_seconds),
            ("hop_seconds", p.hop_seconds),
        ] {
            if !(value.is_finite() && value > 0.0) {
                errors.push(format!("{name}.{field} must be a positive finite number (got {value})"));
            }
        }
        if p.target_rate_hz > p.source_rate_hz {
            errors.push(format!(
                "{name}.target_rate_hz ({}) must be <= source_rate_hz ({})",
                p.target_rate_hz, p.source_rate_hz
            ));
        }
        if p.channels == 0 {
            errors.push(format!("{name}.channels must be > 0"));
        }
        if p.max_windows_per_file == Some(0) {
            errors.push(format!("{name}.max_windows_per_file must be > 0 when set"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Preprocessing
// ============================================================================

/// Raw-signal geometry before it is turned into a [`crate::model::PreprocessConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSettings {
    /// Acquisition rate of the raw CSV (Hz)
    #[serde(default = "default_source_rate_hz")]
    pub source_rate_hz: f64,

    /// Desired rate after decimation (Hz)
    #[serde(default = "default_target_rate_hz")]
    pub target_rate_hz: f64,

    /// Window length (seconds, at the target rate)
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,

    /// Hop between windows (seconds, at the target rate)
    #[serde(default = "default_hop_seconds")]
    pub hop_seconds: f64,

    /// Disable to keep the raw rate (decimation factor 1)
    #[serde(default = "default_true")]
    pub decimate: bool,

    /// Number of sensor channels taken from each CSV
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Optional cap on windows per file during dataset preparation
    #[serde(default)]
    pub max_windows_per_file: Option<usize>,
}

fn default_source_rate_hz() -> f64 { defaults::SOURCE_RATE_HZ }
fn default_target_rate_hz() -> f64 { defaults::TARGET_RATE_HZ }
fn default_window_seconds() -> f64 { defaults::WINDOW_SECONDS }
fn default_hop_seconds() -> f64 { defaults::HOP_SECONDS }
fn default_channels() -> usize { defaults::SIGNAL_CHANNELS }
fn default_true() -> bool { true }

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            source_rate_hz: default_source_rate_hz(),
            target_rate_hz: default_target_rate_hz(),
            window_seconds: default_window_seconds(),
            hop_seconds: default_hop_seconds(),
            decimate: true,
            channels: default_channels(),
            max_windows_per_file: None,
        }
    }
}

// ============================================================================
// RPM Operating Points
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpmConfig {
    /// Operating points served by this deployment
    #[serde(default = "default_operating_points")]
    pub operating_points: Vec<String>,

    /// Per-RPM preprocessing overrides
    #[serde(default)]
    pub overrides: BTreeMap<String, PreprocessSettings>,
}

fn default_operating_points() -> Vec<String> {
    defaults::OPERATING_POINTS.iter().map(|s| (*s).to_string()).collect()
}

impl Default for RpmConfig {
    fn default() -> Self {
        Self {
            operating_points: default_operating_points(),
            overrides: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Threshold
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Percentile of the training reconstruction error used as the cutoff
    #[serde(default)]
    pub method: ThresholdMethod,
}

// ============================================================================
// Training
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_hidden_layers")]
    pub hidden_layers: Vec<usize>,

    /// Maximum number of epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Training aborts below this many normal windows
    #[serde(default = "default_min_training_windows")]
    pub min_training_windows: usize,

    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_n_iter_no_change")]
    pub n_iter_no_change: usize,

    /// Case ids treated as normal condition during offline training
    #[serde(default = "default_normal_case_ids")]
    pub normal_case_ids: Vec<u32>,
}

fn default_hidden_layers() -> Vec<usize> { defaults::HIDDEN_LAYERS.to_vec() }
fn default_epochs() -> usize { defaults::MAX_EPOCHS }
fn default_learning_rate() -> f64 { defaults::LEARNING_RATE }
fn default_batch_size() -> usize { defaults::BATCH_SIZE }
fn default_seed() -> u64 { defaults::TRAINING_SEED }
fn default_min_training_windows() -> usize { defaults::MIN_TRAINING_WINDOWS }
fn default_tolerance() -> f64 { defaults::TRAINING_TOLERANCE }
fn default_n_iter_no_change() -> usize { defaults::N_ITER_NO_CHANGE }
fn default_normal_case_ids() -> Vec<u32> { vec![0] }

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            hidden_layers: default_hidden_layers(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            min_training_windows: default_min_training_windows(),
            tolerance: default_tolerance(),
            n_iter_no_change: default_n_iter_no_change(),
            normal_case_ids: default_normal_case_ids(),
        }
    }
}

// ============================================================================
// Drift
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Recent-error window length; also the minimum for the KS signal
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_variance_limit")]
    pub variance_limit: f64,

    #[serde(default = "default_tcr_limit")]
    pub tcr_limit: f64,

    #[serde(default = "default_ks_alpha")]
    pub ks_alpha: f64,

    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
}

fn default_window_size() -> usize { defaults::DRIFT_WINDOW_SIZE }
fn default_variance_limit() -> f64 { defaults::DRIFT_VARIANCE_LIMIT }
fn default_tcr_limit() -> f64 { defaults::DRIFT_TCR_LIMIT }
fn default_ks_alpha() -> f64 { defaults::DRIFT_KS_ALPHA }
fn default_histogram_bins() -> usize { defaults::HISTOGRAM_BINS }

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            variance_limit: default_variance_limit(),
            tcr_limit: default_tcr_limit(),
            ks_alpha: default_ks_alpha(),
            histogram_bins: default_histogram_bins(),
        }
    }
}

// ============================================================================
// Retrain
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// Count trigger fires on every positive multiple of this value
    #[serde(default = "default_count_interval")]
    pub count_interval: u64,

    /// Upper bound for one retraining run
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_min_files")]
    pub min_files: usize,
}

fn default_count_interval() -> u64 { defaults::RETRAIN_COUNT_INTERVAL }
fn default_timeout_secs() -> u64 { defaults::RETRAIN_TIMEOUT_SECS }
fn default_min_files() -> usize { defaults::RETRAIN_MIN_FILES }

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            count_interval: default_count_interval(),
            timeout_secs: default_timeout_secs(),
            min_files: default_min_files(),
        }
    }
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Uploads whose mean moved by this much or more are not persisted
    #[serde(default = "default_mean_diff_limit")]
    pub mean_diff_limit: f64,
}

fn default_mean_diff_limit() -> f64 { defaults::MEAN_DIFF_LIMIT }

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mean_diff_limit: default_mean_diff_limit(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of per-RPM model artifacts (`model_{rpm}/…`)
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Root of per-RPM feature caches and prepared datasets (`{rpm}/…`)
    #[serde(default = "default_feature_dir")]
    pub feature_dir: PathBuf,

    /// Copies of validated uploads (`{rpm}/…`)
    #[serde(default = "default_validated_dir")]
    pub validated_dir: PathBuf,

    /// Sample record database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_model_dir() -> PathBuf { PathBuf::from("./data/models") }
fn default_feature_dir() -> PathBuf { PathBuf::from("./data/features") }
fn default_validated_dir() -> PathBuf { PathBuf::from("./data/validated") }
fn default_db_path() -> PathBuf { PathBuf::from("./data/samples.db") }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            feature_dir: default_feature_dir(),
            validated_dir: default_validated_dir(),
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Place every location under `root` (tests and throwaway deployments).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            model_dir: root.join("models"),
            feature_dir: root.join("features"),
            validated_dir: root.join("validated"),
            db_path: root.join("samples.db"),
        }
    }
}

// ============================================================================
// Server Config
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address.
    ///
    /// Can be overridden by `VIBE_GUARD_SERVER_ADDR` env var or `--addr` CLI flag.
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drift.window_size, 100);
        assert_eq!(config.retrain.count_interval, 100);
        assert_eq!(config.threshold.method, ThresholdMethod::P95);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
            [threshold]
            method = "p99"

            [drift]
            variance_limit = 2.5
        "#;
        let config = GuardConfig::from_toml_str(toml_str).expect("parse");
        assert_eq!(config.threshold.method, ThresholdMethod::P99);
        assert!((config.drift.variance_limit - 2.5).abs() < f64::EPSILON);
        assert!((config.drift.tcr_limit - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.training.hidden_layers, vec![64, 16, 64]);
    }

    #[test]
    fn test_rpm_override_is_used() {
        let toml_str = r#"
            [rpm.overrides."1200"]
            source_rate_hz = 5000000.0
            channels = 1
        "#;
        let config = GuardConfig::from_toml_str(toml_str).expect("parse");
        assert_eq!(config.preprocess_for("1200").channels, 1);
        assert_eq!(config.preprocess_for("800").channels, 2);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = GuardConfig::default();
        config.drift.tcr_limit = 1.5;
        config.retrain.count_interval = 0;
        config.preprocess.window_seconds = -1.0;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 3, "errors: {errors:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_toml() {
        let config = GuardConfig::default();
        let text = config.to_toml().expect("serialize");
        let back = GuardConfig::from_toml_str(&text).expect("parse");
        assert_eq!(back.drift, config.drift);
        assert_eq!(back.preprocess, config.preprocess);
    }
}
