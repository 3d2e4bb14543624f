//! Overlapping fixed-length framing.

use ndarray::{s, Array2, Array3};

use super::ProcessingError;

/// Number of windows of `win` samples with stride `hop` that fit in `n` samples.
pub fn window_count(n: usize, win: usize, hop: usize) -> usize {
    if win == 0 || hop == 0 || n < win {
        0
    } else {
        (n - win) / hop + 1
    }
}

/// Slice a `[N, C]` signal into `[B, win, C]` windows starting at
/// `0, hop, 2*hop, …` while the window still fits.
///
/// A signal shorter than one window yields an empty `(0, win, C)` array.
pub fn frame(signal: &Array2<f64>, win: usize, hop: usize) -> Result<Array3<f64>, ProcessingError> {
    if win == 0 || hop == 0 {
        return Err(ProcessingError::InvalidConfig(format!(
            "window and hop must be >= 1 (win={win}, hop={hop})"
        )));
    }

    let (n, channels) = signal.dim();
    let count = window_count(n, win, hop);
    let mut out = Array3::<f64>::zeros((count, win, channels));
    for b in 0..count {
        let start = b * hop;
        out.slice_mut(s![b, .., ..])
            .assign(&signal.slice(s![start..start + win, ..]));
    }
    Ok(out)
}
