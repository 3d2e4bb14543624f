//! Sliding error window and the three-signal drift evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

use super::ks::ks_2samp;
use crate::config::DriftConfig;

/// One validated-ingest error observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObservation {
    pub error: f64,
    pub observed_at: DateTime<Utc>,
    /// sha256 of the stored sample the error came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    /// Version of the bundle that scored the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_by: Option<String>,
}

impl ErrorObservation {
    pub fn new(error: f64) -> Self {
        Self {
            error,
            observed_at: Utc::now(),
            sample: None,
            scored_by: None,
        }
    }

    pub fn with_sample(mut self, sha256: impl Into<String>) -> Self {
        self.sample = Some(sha256.into());
        self
    }

    pub fn scored_by(mut self, version: impl Into<String>) -> Self {
        self.scored_by = Some(version.into());
        self
    }
}

impl From<f64> for ErrorObservation {
    fn from(error: f64) -> Self {
        Self::new(error)
    }
}

/// Bounded, time-ordered FIFO of the most recent error observations.
#[derive(Debug, Clone)]
pub struct DriftWindow {
    capacity: usize,
    entries: VecDeque<ErrorObservation>,
}

impl DriftWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Seed from stored history (oldest first), keeping only the newest entries.
    pub fn from_history(capacity: usize, history: impl IntoIterator<Item = ErrorObservation>) -> Self {
        let mut window = Self::new(capacity);
        for observation in history {
            window.push_observation(observation);
        }
        window
    }

    pub fn push(&mut self, error: f64) {
        self.push_observation(ErrorObservation::new(error));
    }

    pub fn push_observation(&mut self, observation: ErrorObservation) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(observation);
    }

    pub fn errors(&self) -> Vec<f64> {
        self.entries.iter().map(|o| o.error).collect()
    }

    pub fn observations(&self) -> impl Iterator<Item = &ErrorObservation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every observation that came from stored sample `sha256`.
    pub fn remove_sample(&mut self, sha256: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|o| o.sample.as_deref() != Some(sha256));
        before - self.entries.len()
    }
}

/// Outcome of one drift evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub samples: usize,
    pub variance: f64,
    pub tcr: f64,
    pub p_value: f64,
    pub variance_high: bool,
    pub tcr_high: bool,
    pub shape_collapsed: bool,
    pub should_retrain: bool,
}

/// Conjunctive variance / threshold-crossing-rate / KS drift test.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    config: DriftConfig,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DriftConfig::default())
    }
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Evaluate `recent` errors against the frozen `baseline` sample and the
    /// operating `threshold`.
    ///
    /// The KS signal can only fire once `recent` holds a full window.
    pub fn evaluate(&self, recent: &[f64], baseline: &[f64], threshold: f64) -> DriftReport {
        let variance = population_variance(recent);
        let tcr = crossing_rate(recent, threshold);
        let p_value = ks_2samp(baseline, recent).p_value;

        let variance_high = variance > self.config.variance_limit;
        let tcr_high = tcr > self.config.tcr_limit;
        let shape_collapsed = recent.len() >= self.config.window_size
            && !baseline.is_empty()
            && p_value < self.config.ks_alpha;

        DriftReport {
            samples: recent.len(),
            variance,
            tcr,
            p_value,
            variance_high,
            tcr_high,
            shape_collapsed,
            should_retrain: variance_high && tcr_high && shape_collapsed,
        }
    }
}

/// Population variance; 0 for an empty slice.
pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().population_variance()
}

/// Fraction of `values` strictly above `threshold`; 0 for an empty slice.
pub fn crossing_rate(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&v| v > threshold).count() as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> Vec<f64> {
        (0..200).map(|i| 0.1 + f64::from(i % 10) * 0.01).collect()
    }

    /// Errors alternating between 0.1 and `high`: half above any mid threshold.
    fn drifted(n: usize, high: f64) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { 0.1 } else { high }).collect()
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = DriftWindow::new(3);
        for e in [1.0, 2.0, 3.0, 4.0] {
            window.push(e);
        }
        assert_eq!(window.errors(), vec![2.0, 3.0, 4.0]);
        assert!(window.is_full());
        window.clear();
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_from_history_keeps_newest() {
        let history = (0..150).map(|i| ErrorObservation::new(f64::from(i)));
        let window = DriftWindow::from_history(100, history);
        assert_eq!(window.len(), 100);
        assert_eq!(window.errors()[0], 50.0);
    }

    #[test]
    fn test_remove_sample_drops_only_its_errors() {
        let mut window = DriftWindow::new(10);
        window.push_observation(ErrorObservation::new(1.0).with_sample("aa"));
        window.push_observation(ErrorObservation::new(2.0).with_sample("bb"));
        window.push(3.0);
        window.push_observation(ErrorObservation::new(4.0).with_sample("aa"));

        assert_eq!(window.remove_sample("aa"), 2);
        assert_eq!(window.errors(), vec![2.0, 3.0]);
        assert_eq!(window.remove_sample("cc"), 0);
    }

    #[test]
    fn test_all_three_signals_trigger_retrain() {
        let detector = DriftDetector::default();
        let recent = drifted(100, 5.0);
        let report = detector.evaluate(&recent, &baseline(), 0.5);
        // variance of {0.1, 5.0} halves = 2.45² ≈ 6.0
        assert!(report.variance_high, "{report:?}");
        assert!(report.tcr_high);
        assert!((report.tcr - 0.5).abs() < 1e-12);
        assert!(report.shape_collapsed);
        assert!(report.should_retrain);
    }

    #[test]
    fn test_fewer_than_window_never_collapses_shape() {
        let detector = DriftDetector::default();
        let recent = drifted(99, 5.0);
        let report = detector.evaluate(&recent, &baseline(), 0.5);
        assert!(report.variance_high);
        assert!(report.tcr_high);
        assert!(report.p_value < 0.05);
        assert!(!report.shape_collapsed);
        assert!(!report.should_retrain);
    }

    #[test]
    fn test_low_variance_blocks_retrain() {
        let detector = DriftDetector::default();
        // Shifted and mostly above threshold, but tightly clustered.
        let recent = drifted(100, 0.9);
        let report = detector.evaluate(&recent, &baseline(), 0.5);
        assert!(!report.variance_high);
        assert!(report.tcr_high);
        assert!(report.shape_collapsed);
        assert!(!report.should_retrain);
    }

    #[test]
    fn test_low_crossing_rate_blocks_retrain() {
        let detector = DriftDetector::default();
        // Far from baseline and widely spread, but the threshold sits above
        // every error.
        let recent = drifted(100, 5.0);
        let report = detector.evaluate(&recent, &baseline(), 10.0);
        assert!(report.variance_high);
        assert!(report.shape_collapsed);
        assert_eq!(report.tcr, 0.0);
        assert!(!report.tcr_high);
        assert!(!report.should_retrain);
    }

    #[test]
    fn test_matching_shape_blocks_retrain() {
        let detector = DriftDetector::default();
        // A full window that is noisy and often above threshold, drawn from
        // the same distribution as a noisy baseline.
        let base = drifted(200, 5.0);
        let recent = drifted(100, 5.0);
        let report = detector.evaluate(&recent, &base, 0.5);
        assert_eq!(report.samples, 100);
        assert!(report.variance_high);
        assert!(report.tcr_high);
        assert!(report.p_value > 0.05, "{report:?}");
        assert!(!report.shape_collapsed);
        assert!(!report.should_retrain);
    }

    #[test]
    fn test_tcr_uses_strict_comparison() {
        assert!((crossing_rate(&[0.5, 0.5, 1.0, 0.1], 0.5) - 0.25).abs() < 1e-12);
        assert_eq!(crossing_rate(&[], 0.5), 0.0);
    }

    #[test]
    fn test_population_variance() {
        assert!((population_variance(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
        assert_eq!(population_variance(&[]), 0.0);
    }

    #[test]
    fn test_stable_errors_do_not_drift() {
        let detector = DriftDetector::default();
        let base = baseline();
        let report = detector.evaluate(&base[..100], &base, 0.5);
        assert!(!report.should_retrain);
        assert_eq!(report.tcr, 0.0);
        assert!(report.p_value > 0.05);
    }
}
