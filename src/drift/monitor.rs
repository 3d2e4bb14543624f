//! Monitoring analysis: drift metrics plus a baseline-vs-current histogram.

use serde::{Deserialize, Serialize};

use super::detector::{crossing_rate, population_variance};
use super::ks::ks_2samp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMetrics {
    pub variance: f64,
    pub tcr: f64,
    pub p_value: f64,
    pub current_error: f64,
    pub limit: f64,
}

/// One histogram bucket with the fraction of each sample falling in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub range: String,
    pub baseline: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub metrics: DriftMetrics,
    #[serde(rename = "chartData")]
    pub chart_data: Vec<HistogramBin>,
}

/// Compare recent errors with the model's baseline errors.
pub fn analyze(
    recent: &[f64],
    baseline: &[f64],
    limit: f64,
    current_error: f64,
    bins: usize,
) -> MonitoringSnapshot {
    MonitoringSnapshot {
        metrics: DriftMetrics {
            variance: population_variance(recent),
            tcr: crossing_rate(recent, limit),
            p_value: ks_2samp(baseline, recent).p_value,
            current_error,
            limit,
        },
        chart_data: histogram(baseline, recent, bins),
    }
}

/// Shared equal-width bins over the combined range of both samples.
/// Each series is normalized to fractions of its own size.
pub fn histogram(baseline: &[f64], current: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite = || baseline.iter().chain(current).copied().filter(|v| v.is_finite());
    let (Some(lo), Some(hi)) = (
        finite().reduce(f64::min),
        finite().reduce(f64::max),
    ) else {
        return Vec::new();
    };
    if bins == 0 {
        return Vec::new();
    }

    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
    let bucket = |v: f64| (((v - lo) / width) as usize).min(bins - 1);
    let fractions = |values: &[f64]| {
        let mut counts = vec![0usize; bins];
        let mut total = 0usize;
        for &v in values.iter().filter(|v| v.is_finite()) {
            counts[bucket(v)] += 1;
            total += 1;
        }
        counts
            .into_iter()
            .map(|c| if total == 0 { 0.0 } else { c as f64 / total as f64 })
            .collect::<Vec<_>>()
    };

    let base = fractions(baseline);
    let curr = fractions(current);
    (0..bins)
        .map(|i| {
            let start = lo + width * i as f64;
            let range = if i + 1 == bins {
                format!("{start:.3}+")
            } else {
                format!("{start:.3}-{:.3}", start + width)
            };
            HistogramBin {
                range,
                baseline: base[i],
                current: curr[i],
            }
        })
        .collect()
}
