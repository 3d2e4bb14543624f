//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery. Every value here is the default
//! of a field in [`super::GuardConfig`].

// ============================================================================
// Preprocessing
// ============================================================================

/// Raw acquisition rate of the vibration sensors (Hz).
pub const SOURCE_RATE_HZ: f64 = 10_000_000.0;

/// Sample rate after decimation (Hz).
pub const TARGET_RATE_HZ: f64 = 20_000.0;

/// Analysis window length (seconds). 0.02 s = 400 samples at 20 kHz.
pub const WINDOW_SECONDS: f64 = 0.02;

/// Hop between window starts (seconds). 50% overlap with the default window.
pub const HOP_SECONDS: f64 = 0.01;

/// Number of sensor channels taken from each CSV.
pub const SIGNAL_CHANNELS: usize = 2;

/// Half-length multiplier of the anti-aliasing FIR (taps = 2 * 10 * q + 1).
pub const FIR_HALF_LENGTH_PER_FACTOR: usize = 10;

/// Floor added to every feature standard deviation.
pub const STD_EPSILON: f64 = 1e-8;

// ============================================================================
// Operating points
// ============================================================================

/// RPM operating points with an independently trained model.
pub const OPERATING_POINTS: [&str; 3] = ["800", "1000", "1200"];

// ============================================================================
// Training
// ============================================================================

/// Autoencoder hidden layer sizes.
pub const HIDDEN_LAYERS: [usize; 3] = [64, 16, 64];

/// Maximum number of training epochs.
pub const MAX_EPOCHS: usize = 500;

/// Adam learning rate.
pub const LEARNING_RATE: f64 = 0.001;

/// Mini-batch size (capped at the training set size).
pub const BATCH_SIZE: usize = 200;

/// Seed for weight initialization and shuffling.
pub const TRAINING_SEED: u64 = 42;

/// Minimum number of normal windows required to fit a model.
pub const MIN_TRAINING_WINDOWS: usize = 5;

/// Loss improvement below which an epoch counts as "no change".
pub const TRAINING_TOLERANCE: f64 = 1e-4;

/// Consecutive non-improving epochs before early stopping.
pub const N_ITER_NO_CHANGE: usize = 10;

// ============================================================================
// Drift detection
// ============================================================================

/// Number of most recent reconstruction errors kept per RPM.
pub const DRIFT_WINDOW_SIZE: usize = 100;

/// Variance of recent errors above which the variance signal fires.
///
/// Fixed, uncalibrated constant inherited from the first deployment.
pub const DRIFT_VARIANCE_LIMIT: f64 = 1.5;

/// Fraction of recent errors above threshold at which the TCR signal fires.
pub const DRIFT_TCR_LIMIT: f64 = 0.2;

/// KS p-value below which the error distribution is considered shifted.
pub const DRIFT_KS_ALPHA: f64 = 0.05;

/// Histogram bins reported by the monitoring analysis.
pub const HISTOGRAM_BINS: usize = 5;

// ============================================================================
// Retraining
// ============================================================================

/// Validated-sample count interval for the count trigger.
pub const RETRAIN_COUNT_INTERVAL: u64 = 100;

/// Upper bound on a single retraining run (seconds).
pub const RETRAIN_TIMEOUT_SECS: u64 = 1_800;

/// Minimum number of stored files needed to attempt a retrain.
pub const RETRAIN_MIN_FILES: usize = 1;

// ============================================================================
// Ingest
// ============================================================================

/// Maximum allowed shift of the signal mean against the previous sample
/// before an upload is refused for persistence.
pub const MEAN_DIFF_LIMIT: f64 = 5.0;

/// Maximum accepted upload size (bytes).
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
