//! Spectral feature extraction using rustfft
//!
//! Each window becomes `log(1 + |rfft|)` of every channel. The feature vector
//! is laid out frequency-major: column `f * C + c` holds bin `f` of channel
//! `c`, giving `D = (win / 2 + 1) * C` features per window.

use ndarray::{s, Array2, Array3};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::ProcessingError;

/// Feature vector length for a window of `win` samples and `channels` channels.
pub fn feature_dim(win: usize, channels: usize) -> usize {
    (win / 2 + 1) * channels
}

/// Pre-planned window featurizer.
pub struct SpectralFeaturizer {
    win: usize,
    fft: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for SpectralFeaturizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralFeaturizer").field("win", &self.win).finish()
    }
}

impl SpectralFeaturizer {
    pub fn new(win: usize) -> Result<Self, ProcessingError> {
        if win == 0 {
            return Err(ProcessingError::InvalidConfig(
                "window length must be >= 1".to_string(),
            ));
        }
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(win);
        Ok(Self { win, fft })
    }

    pub fn window_len(&self) -> usize {
        self.win
    }

    pub fn bins(&self) -> usize {
        self.win / 2 + 1
    }

    /// Featurize `[B, win, C]` windows into a `[B, D]` matrix.
    pub fn featurize(&self, frames: &Array3<f64>) -> Result<Array2<f64>, ProcessingError> {
        let (count, win, channels) = frames.dim();
        if win != self.win {
            return Err(ProcessingError::InvalidConfig(format!(
                "featurizer planned for {} samples, frames have {win}",
                self.win
            )));
        }

        let bins = self.bins();
        let dim = bins * channels;
        let rows: Vec<Vec<f64>> = (0..count)
            .into_par_iter()
            .map(|b| {
                let mut row = vec![0.0; dim];
                let mut buffer = vec![Complex::new(0.0, 0.0); win];
                for c in 0..channels {
                    let column = frames.slice(s![b, .., c]);
                    for (slot, &x) in buffer.iter_mut().zip(column.iter()) {
                        *slot = Complex::new(x, 0.0);
                    }
                    self.fft.process(&mut buffer);
                    for (f, value) in buffer.iter().take(bins).enumerate() {
                        row[f * channels + c] = value.norm().ln_1p();
                    }
                }
                row
            })
            .collect();

        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((count, dim), flat)
            .map_err(|e| ProcessingError::InvalidConfig(format!("feature shape: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_feature_dim() {
        assert_eq!(feature_dim(400, 2), 402);
        assert_eq!(feature_dim(401, 1), 201);
    }

    #[test]
    fn test_constant_window_has_dc_only() {
        let featurizer = SpectralFeaturizer::new(8).expect("plan");
        let frames = Array3::from_elem((1, 8, 1), 1.0);
        let features = featurizer.featurize(&frames).expect("featurize");
        assert_eq!(features.shape(), &[1, 5]);
        // |DC| = 8
        assert!((features[[0, 0]] - 9.0_f64.ln()).abs() < 1e-12);
        for f in 1..5 {
            assert!(features[[0, f]].abs() < 1e-12);
        }
    }

    #[test]
    fn test_frequency_major_layout() {
        let win = 16;
        let featurizer = SpectralFeaturizer::new(win).expect("plan");
        // Channel 0 is a tone in bin 2, channel 1 a tone in bin 5.
        let frames = Array3::from_shape_fn((1, win, 2), |(_, i, c)| {
            let bin = if c == 0 { 2.0 } else { 5.0 };
            (2.0 * PI * bin * i as f64 / win as f64).cos()
        });
        let features = featurizer.featurize(&frames).expect("featurize");
        assert_eq!(features.ncols(), 18);

        let expected = (1.0 + win as f64 / 2.0).ln();
        assert!((features[[0, 2 * 2]] - expected).abs() < 1e-9);
        assert!((features[[0, 5 * 2 + 1]] - expected).abs() < 1e-9);
        assert!(features[[0, 2 * 2 + 1]].abs() < 1e-9);
        assert!(features[[0, 5 * 2]].abs() < 1e-9);
    }

    #[test]
    fn test_window_length_mismatch() {
        let featurizer = SpectralFeaturizer::new(8).expect("plan");
        let frames = Array3::<f64>::zeros((2, 4, 1));
        assert!(featurizer.featurize(&frames).is_err());
    }
}
