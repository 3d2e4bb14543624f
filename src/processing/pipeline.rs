//! Composed preprocessing chain: decimate → center → frame → featurize.
//!
//! The same [`FeaturePipeline`] is used when building the training set and
//! at inference time, so the two paths cannot disagree on geometry or
//! column layout.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{frame, Decimator, ProcessingError, RawSignal, SpectralFeaturizer};
use crate::config::PreprocessSettings;

/// Resolved per-RPM preprocessing geometry (integer sample counts).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Raw acquisition rate (Hz)
    pub source_rate: f64,
    /// Effective rate after decimation (Hz)
    pub target_rate: f64,
    pub decimation_factor: usize,
    pub window_samples: usize,
    pub hop_samples: usize,
    pub channels: usize,
}

impl PreprocessConfig {
    /// Resolve operator settings into sample counts.
    ///
    /// `decimation_factor = max(1, round(source / target))`, the effective
    /// rate is `round(source / factor)`, and window/hop are rounded against
    /// that effective rate.
    pub fn from_settings(settings: &PreprocessSettings) -> Result<Self, ProcessingError> {
        let source = settings.source_rate_hz;
        if !(source.is_finite() && source > 0.0) {
            return Err(ProcessingError::InvalidConfig(format!(
                "source rate must be positive (got {source})"
            )));
        }
        if !(settings.target_rate_hz.is_finite() && settings.target_rate_hz > 0.0) {
            return Err(ProcessingError::InvalidConfig(format!(
                "target rate must be positive (got {})",
                settings.target_rate_hz
            )));
        }

        let (factor, fs) = if settings.decimate {
            let factor = ((source / settings.target_rate_hz).round() as usize).max(1);
            (factor, (source / factor as f64).round())
        } else {
            (1, source)
        };

        let window_samples = (settings.window_seconds * fs).round();
        let hop_samples = (settings.hop_seconds * fs).round();
        if !(window_samples >= 1.0 && hop_samples >= 1.0) {
            return Err(ProcessingError::InvalidConfig(format!(
                "window ({window_samples}) and hop ({hop_samples}) must both be >= 1 sample at {fs} Hz"
            )));
        }
        if settings.channels == 0 {
            return Err(ProcessingError::InvalidConfig("channels must be >= 1".to_string()));
        }

        Ok(Self {
            source_rate: source,
            target_rate: fs,
            decimation_factor: factor,
            window_samples: window_samples as usize,
            hop_samples: hop_samples as usize,
            channels: settings.channels,
        })
    }

    /// Feature vector length `(win / 2 + 1) * C`.
    pub fn feature_dim(&self) -> usize {
        super::feature_dim(self.window_samples, self.channels)
    }
}

/// Deterministic raw-signal to feature-matrix transform for one RPM.
#[derive(Debug)]
pub struct FeaturePipeline {
    config: PreprocessConfig,
    decimator: Decimator,
    featurizer: SpectralFeaturizer,
    max_windows: Option<usize>,
}

impl FeaturePipeline {
    pub fn new(config: PreprocessConfig) -> Result<Self, ProcessingError> {
        Ok(Self {
            decimator: Decimator::new(config.decimation_factor)?,
            featurizer: SpectralFeaturizer::new(config.window_samples)?,
            config,
            max_windows: None,
        })
    }

    /// Keep at most `limit` leading windows per signal.
    pub fn with_max_windows(mut self, limit: Option<usize>) -> Self {
        self.max_windows = limit;
        self
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Raw signal to un-normalized `[B, D]` features.
    ///
    /// Fails with [`ProcessingError::InsufficientData`] when the decimated
    /// signal cannot hold a single window; callers treat that as a skip.
    pub fn extract(&self, signal: &RawSignal) -> Result<Array2<f64>, ProcessingError> {
        if signal.channel_count() != self.config.channels {
            return Err(ProcessingError::ChannelMismatch {
                expected: self.config.channels,
                actual: signal.channel_count(),
            });
        }
        let tolerance = self.config.source_rate * 1e-9;
        if (signal.sample_rate() - self.config.source_rate).abs() > tolerance {
            return Err(ProcessingError::InvalidConfig(format!(
                "signal sampled at {} Hz, pipeline expects {} Hz",
                signal.sample_rate(),
                self.config.source_rate
            )));
        }

        let mut decimated = self.decimator.apply(signal)?;
        if let Some(means) = decimated.mean_axis(Axis(0)) {
            decimated -= &means;
        }

        let frames = frame(
            &decimated,
            self.config.window_samples,
            self.config.hop_samples,
        )?;
        let mut count = frames.len_of(Axis(0));
        if count == 0 {
            return Err(ProcessingError::InsufficientData {
                window: self.config.window_samples,
                available: decimated.nrows(),
            });
        }

        let frames = match self.max_windows {
            Some(limit) if count > limit => {
                count = limit;
                frames.slice_axis(Axis(0), (0..limit).into()).to_owned()
            }
            _ => frames,
        };

        debug!(
            samples = signal.len(),
            decimated = decimated.nrows(),
            windows = count,
            "Extracted spectral features"
        );
        self.featurizer.featurize(&frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn settings(source: f64, target: f64) -> PreprocessSettings {
        PreprocessSettings {
            source_rate_hz: source,
            target_rate_hz: target,
            channels: 1,
            ..PreprocessSettings::default()
        }
    }

    #[test]
    fn test_default_geometry() {
        let config = PreprocessConfig::from_settings(&PreprocessSettings::default()).expect("config");
        assert_eq!(config.decimation_factor, 500);
        assert!((config.target_rate - 20_000.0).abs() < f64::EPSILON);
        assert_eq!(config.window_samples, 400);
        assert_eq!(config.hop_samples, 200);
        assert_eq!(config.feature_dim(), 402);
    }

    #[test]
    fn test_decimation_disabled() {
        let mut s = settings(20_000.0, 1_000.0);
        s.decimate = false;
        let config = PreprocessConfig::from_settings(&s).expect("config");
        assert_eq!(config.decimation_factor, 1);
        assert_eq!(config.window_samples, 400);
    }

    #[test]
    fn test_window_rounds_to_zero_is_rejected() {
        let mut s = settings(1_000.0, 1_000.0);
        s.window_seconds = 0.0001;
        assert!(matches!(
            PreprocessConfig::from_settings(&s),
            Err(ProcessingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_extract_shapes() {
        // 200 kHz decimated by 10 to 20 kHz; 0.1 s → 2000 samples after decimation.
        let config = PreprocessConfig::from_settings(&settings(200_000.0, 20_000.0)).expect("config");
        let pipeline = FeaturePipeline::new(config).expect("pipeline");
        let x: Vec<f32> = (0..20_000)
            .map(|i| (2.0 * PI * 1_000.0 * i as f64 / 200_000.0).sin() as f32)
            .collect();
        let signal = RawSignal::new(200_000.0, vec![x]).expect("signal");
        let features = pipeline.extract(&signal).expect("extract");
        assert_eq!(features.nrows(), (2000 - 400) / 200 + 1);
        assert_eq!(features.ncols(), 201);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let config = PreprocessConfig::from_settings(&settings(40_000.0, 20_000.0)).expect("config");
        let pipeline = FeaturePipeline::new(config).expect("pipeline");
        let x: Vec<f32> = (0..4_000).map(|i| ((i % 37) as f32).sin()).collect();
        let signal = RawSignal::new(40_000.0, vec![x]).expect("signal");
        let a = pipeline.extract(&signal).expect("extract");
        let b = pipeline.extract(&signal).expect("extract");
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_short_after_decimation() {
        let config = PreprocessConfig::from_settings(&settings(40_000.0, 20_000.0)).expect("config");
        let pipeline = FeaturePipeline::new(config).expect("pipeline");
        let signal = RawSignal::new(40_000.0, vec![vec![0.5; 500]]).expect("signal");
        let err = pipeline.extract(&signal).unwrap_err();
        assert!(matches!(err, ProcessingError::InsufficientData { window: 400, .. }));
        assert_eq!(err.skip_reason(), "too_short_after_decimate");
    }

    #[test]
    fn test_max_windows_cap() {
        let config = PreprocessConfig::from_settings(&settings(20_000.0, 20_000.0)).expect("config");
        let pipeline = FeaturePipeline::new(config).expect("pipeline").with_max_windows(Some(3));
        let signal = RawSignal::new(20_000.0, vec![vec![0.0; 4_000]]).expect("signal");
        assert_eq!(pipeline.extract(&signal).expect("extract").nrows(), 3);
    }

    #[test]
    fn test_channel_mismatch() {
        let config = PreprocessConfig::from_settings(&settings(20_000.0, 20_000.0)).expect("config");
        let pipeline = FeaturePipeline::new(config).expect("pipeline");
        let signal = RawSignal::new(20_000.0, vec![vec![0.0; 800], vec![0.0; 800]]).expect("signal");
        assert!(matches!(
            pipeline.extract(&signal),
            Err(ProcessingError::ChannelMismatch { expected: 1, actual: 2 })
        ));
    }
}
