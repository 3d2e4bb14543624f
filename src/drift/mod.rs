//! Drift detection over recent reconstruction errors
//!
//! - `ks`: two-sample Kolmogorov–Smirnov test
//! - `detector`: per-RPM sliding error window and the conjunctive
//!   variance / threshold-crossing-rate / distribution-shape trigger
//! - `monitor`: the same metrics plus histogram data for dashboards

mod detector;
mod ks;
mod monitor;

pub use detector::{
    crossing_rate, population_variance, DriftDetector, DriftReport, DriftWindow, ErrorObservation,
};
pub use ks::{ks_2samp, KsResult};
pub use monitor::{analyze, histogram, DriftMetrics, HistogramBin, MonitoringSnapshot};
