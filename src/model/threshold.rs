//! Anomaly threshold derivation and batch classification.

use serde::{Deserialize, Serialize};

use super::ModelError;

/// Percentile of the normal-condition reconstruction error used as cutoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    /// 95th percentile, the serving default
    #[default]
    P95,
    /// 99th percentile, the stricter offline setting
    P99,
}

impl ThresholdMethod {
    pub fn percentile(self) -> f64 {
        match self {
            Self::P95 => 95.0,
            Self::P99 => 99.0,
        }
    }

    /// Label stored in the threshold record, e.g. `p95(train_recon_error)`.
    pub fn label(self) -> String {
        match self {
            Self::P95 => "p95(train_recon_error)".to_string(),
            Self::P99 => "p99(train_recon_error)".to_string(),
        }
    }
}

impl std::fmt::Display for ThresholdMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P95 => write!(f, "p95"),
            Self::P99 => write!(f, "p99"),
        }
    }
}

impl std::str::FromStr for ThresholdMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p95" => Ok(Self::P95),
            "p99" => Ok(Self::P99),
            other => Err(format!("unknown threshold method '{other}' (expected p95 or p99)")),
        }
    }
}

/// Percentile with linear interpolation between closest ranks.
///
/// `q` is in `[0, 100]`. Returns `None` for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Persisted threshold for one RPM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecord {
    pub rpm: String,
    #[serde(default)]
    pub train_cases: Vec<u32>,
    pub threshold_method: String,
    pub threshold: f64,
    pub train_err_mean: f64,
    pub train_err_p95: f64,
    pub train_err_p99: f64,
}

/// Derive the threshold from training-window reconstruction errors.
pub fn derive_threshold(
    rpm: &str,
    train_errors: &[f64],
    method: ThresholdMethod,
    train_cases: &[u32],
) -> Result<ThresholdRecord, ModelError> {
    if train_errors.is_empty() {
        return Err(ModelError::InsufficientTrainingData { have: 0, need: 1 });
    }
    let mean = train_errors.iter().sum::<f64>() / train_errors.len() as f64;
    let p95 = percentile(train_errors, 95.0).unwrap_or(mean);
    let p99 = percentile(train_errors, 99.0).unwrap_or(mean);
    let threshold = match method {
        ThresholdMethod::P95 => p95,
        ThresholdMethod::P99 => p99,
    };

    Ok(ThresholdRecord {
        rpm: rpm.to_string(),
        train_cases: train_cases.to_vec(),
        threshold_method: method.label(),
        threshold,
        train_err_mean: mean,
        train_err_p95: p95,
        train_err_p99: p99,
    })
}

/// A window is anomalous when its error strictly exceeds the threshold.
pub fn is_anomaly(error: f64, threshold: f64) -> bool {
    error > threshold
}

/// Aggregate verdict over all windows of one input (one CSV, one case).
///
/// The batch is anomalous when the p95 of its window errors exceeds the
/// threshold, so neither a lone spike nor the batch mean decides alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchVerdict {
    pub windows: usize,
    pub err_mean: f64,
    pub err_p95: f64,
    pub err_p99: f64,
    pub is_anomaly: bool,
}

impl BatchVerdict {
    pub fn from_errors(errors: &[f64], threshold: f64) -> Option<Self> {
        let p95 = percentile(errors, 95.0)?;
        let p99 = percentile(errors, 99.0)?;
        Some(Self {
            windows: errors.len(),
            err_mean: errors.iter().sum::<f64>() / errors.len() as f64,
            err_p95: p95,
            err_p99: p99,
            is_anomaly: is_anomaly(p95, threshold),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let v: Vec<f64> = (1..=5).map(f64::from).collect();
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(5.0));
        assert_eq!(percentile(&v, 50.0), Some(3.0));
        // rank = 0.95 * 4 = 3.8 → 4 + 0.8 * (5 - 4)
        assert!((percentile(&v, 95.0).unwrap_or_default() - 4.8).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_percentile_ignores_input_order() {
        let a = [3.0, 1.0, 2.0, 5.0, 4.0];
        assert_eq!(percentile(&a, 25.0), Some(2.0));
    }

    #[test]
    fn test_derive_threshold_by_method() {
        let errors: Vec<f64> = (0..100).map(f64::from).collect();
        let p95 = derive_threshold("800", &errors, ThresholdMethod::P95, &[0]).expect("p95");
        let p99 = derive_threshold("800", &errors, ThresholdMethod::P99, &[0]).expect("p99");
        assert!((p95.threshold - 94.05).abs() < 1e-9);
        assert!((p99.threshold - 98.01).abs() < 1e-9);
        assert_eq!(p95.threshold_method, "p95(train_recon_error)");
        assert!((p95.train_err_mean - 49.5).abs() < 1e-12);
        assert!((p95.train_err_p99 - p99.threshold).abs() < 1e-12);
    }

    #[test]
    fn test_derive_threshold_empty() {
        assert!(matches!(
            derive_threshold("800", &[], ThresholdMethod::P95, &[]),
            Err(ModelError::InsufficientTrainingData { .. })
        ));
    }

    #[test]
    fn test_strict_comparison() {
        assert!(!is_anomaly(0.5, 0.5));
        assert!(is_anomaly(0.5000001, 0.5));
    }

    #[test]
    fn test_single_spike_does_not_flag_batch() {
        let mut errors = vec![0.1; 99];
        errors.push(50.0);
        let verdict = BatchVerdict::from_errors(&errors, 1.0).expect("verdict");
        assert!(!verdict.is_anomaly);
        assert!(verdict.err_mean > 0.5);
    }

    #[test]
    fn test_widespread_elevation_flags_batch() {
        let mut errors = vec![0.1; 90];
        errors.extend(vec![3.0; 10]);
        let verdict = BatchVerdict::from_errors(&errors, 1.0).expect("verdict");
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.windows, 100);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("P99".parse::<ThresholdMethod>(), Ok(ThresholdMethod::P99));
        assert!("p90".parse::<ThresholdMethod>().is_err());
    }
}
