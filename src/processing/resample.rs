//! Zero-phase FIR decimation.
//!
//! The anti-aliasing filter is a Hamming-windowed sinc low-pass with
//! `2 * 10 * q + 1` taps and cutoff at the new Nyquist frequency, normalized
//! to unit DC gain. Output sample `k` is the filter centered on input sample
//! `k * q`, so the filter delay is compensated and channels stay phase
//! aligned. Samples beyond either end of the input are treated as zero.

use ndarray::Array2;
use rayon::prelude::*;
use std::f64::consts::PI;

use super::{ProcessingError, RawSignal};
use crate::config::defaults::FIR_HALF_LENGTH_PER_FACTOR;

/// Integer-factor decimator with a precomputed anti-aliasing filter.
#[derive(Debug, Clone)]
pub struct Decimator {
    factor: usize,
    taps: Vec<f64>,
}

impl Decimator {
    /// Design the decimator for `factor`. A factor of 1 is the identity.
    pub fn new(factor: usize) -> Result<Self, ProcessingError> {
        if factor == 0 {
            return Err(ProcessingError::InvalidConfig(
                "decimation factor must be >= 1".to_string(),
            ));
        }
        let taps = if factor == 1 { vec![1.0] } else { design_lowpass(factor) };
        Ok(Self { factor, taps })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    /// Minimum input length the filter accepts.
    pub fn required_len(&self) -> usize {
        if self.factor == 1 {
            1
        } else {
            self.taps.len()
        }
    }

    /// Number of output samples for `input_len` input samples.
    pub fn output_len(&self, input_len: usize) -> usize {
        input_len.div_ceil(self.factor)
    }

    /// Decimate every channel of `signal`, returning an `[N / q, C]` matrix.
    pub fn apply(&self, signal: &RawSignal) -> Result<Array2<f64>, ProcessingError> {
        let n = signal.len();
        if n < self.required_len() {
            return Err(ProcessingError::InsufficientLength {
                needed: self.required_len(),
                available: n,
            });
        }

        let columns: Vec<Vec<f64>> = signal
            .channels()
            .par_iter()
            .map(|channel| self.decimate_channel(channel))
            .collect();

        let out_len = self.output_len(n);
        let mut out = Array2::<f64>::zeros((out_len, columns.len()));
        for (c, column) in columns.iter().enumerate() {
            for (k, &value) in column.iter().enumerate() {
                out[[k, c]] = value;
            }
        }
        Ok(out)
    }

    fn decimate_channel(&self, x: &[f32]) -> Vec<f64> {
        if self.factor == 1 {
            return x.iter().map(|&s| f64::from(s)).collect();
        }

        let n = x.len();
        let q = self.factor;
        let half = (self.taps.len() - 1) / 2;
        let last_tap = self.taps.len() - 1;

        (0..self.output_len(n))
            .map(|k| {
                // y[k] = sum_j h[j] * x[k*q + half - j], restricted to 0 <= index < n
                let center = k * q + half;
                let j_min = center.saturating_sub(n - 1);
                let j_max = center.min(last_tap);
                (j_min..=j_max)
                    .map(|j| self.taps[j] * f64::from(x[center - j]))
                    .sum()
            })
            .collect()
    }
}

/// Hamming-windowed sinc low-pass with cutoff `1/q` of Nyquist, unit DC gain.
fn design_lowpass(factor: usize) -> Vec<f64> {
    let half_len = FIR_HALF_LENGTH_PER_FACTOR * factor;
    let num_taps = 2 * half_len + 1;
    let cutoff = 1.0 / factor as f64;
    let center = half_len as f64;
    let span = (num_taps - 1) as f64;

    let mut taps: Vec<f64> = (0..num_taps)
        .map(|i| {
            let m = i as f64 - center;
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / span).cos();
            cutoff * sinc(cutoff * m) * window
        })
        .collect();

    let gain: f64 = taps.iter().sum();
    for t in &mut taps {
        *t /= gain;
    }
    taps
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}
