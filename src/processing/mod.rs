//! Signal processing module - raw vibration CSV to normalized spectral features
//!
//! Stages, leaf-first:
//!
//! - `csv`: raw CSV bytes to a [`RawSignal`]
//! - `resample`: zero-phase FIR decimation
//! - `framing`: overlapping fixed-length windows
//! - `spectral`: `log(1 + |rfft|)` feature vectors
//! - `normalizer`: per-column standardization fitted once at training time
//! - `pipeline`: the composed, deterministic preprocessing chain

mod csv;
mod framing;
mod normalizer;
mod pipeline;
mod resample;
mod spectral;

pub use csv::{parse_signal_csv, read_signal_csv};
pub use framing::{frame, window_count};
pub use normalizer::{FeatureStats, Normalizer};
pub use pipeline::{FeaturePipeline, PreprocessConfig};
pub use resample::Decimator;
pub use spectral::{feature_dim, SpectralFeaturizer};

use thiserror::Error;

/// Errors in signal processing
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Insufficient length for decimation: filter needs {needed} samples, have {available}")]
    InsufficientLength { needed: usize, available: usize },

    #[error("Insufficient data: window needs {window} samples, decimated signal has {available}")]
    InsufficientData { window: usize, available: usize },

    #[error("Feature dimension mismatch: stored stats have {expected} columns, features have {actual}")]
    FeatureDimensionMismatch { expected: usize, actual: usize },

    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Malformed CSV: {0}")]
    MalformedCsv(String),

    #[error("Invalid preprocessing configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessingError {
    /// Whether the caller should skip this input and move on rather than
    /// fail the whole batch.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientLength { .. }
                | Self::InsufficientData { .. }
                | Self::MalformedCsv(_)
                | Self::ChannelMismatch { .. }
        )
    }

    /// Short machine-readable reason recorded for skipped inputs.
    pub fn skip_reason(&self) -> String {
        match self {
            Self::InsufficientLength { .. } | Self::InsufficientData { .. } => {
                "too_short_after_decimate".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Raw multi-channel vibration signal at its acquisition rate.
///
/// Samples are stored channel-major as `f32`, which is the precision the
/// sensors deliver; everything after decimation runs in `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    sample_rate: f64,
    channels: Vec<Vec<f32>>,
}

impl RawSignal {
    /// Build a signal from per-channel sample vectors of equal length.
    pub fn new(sample_rate: f64, channels: Vec<Vec<f32>>) -> Result<Self, ProcessingError> {
        if channels.is_empty() {
            return Err(ProcessingError::MalformedCsv("signal has no channels".to_string()));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(ProcessingError::MalformedCsv(
                "channels have different lengths".to_string(),
            ));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ProcessingError::InvalidConfig(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        Ok(Self { sample_rate, channels })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Mean of one channel, `None` when the channel is missing or empty.
    pub fn channel_mean(&self, index: usize) -> Option<f64> {
        let samples = self.channel(index)?;
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s)).sum();
        Some(sum / samples.len() as f64)
    }

    /// Keep only the first `count` channels.
    pub fn truncate_channels(mut self, count: usize) -> Self {
        self.channels.truncate(count.max(1));
        self
    }
}
