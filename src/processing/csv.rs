//! Raw vibration CSV ingestion.
//!
//! Acquisition exports are comma separated, sometimes with a header row and
//! sometimes with timestamp or index columns next to the sensor channels.
//! Every cell is coerced to a number; the `channels` columns with the most
//! valid numbers are taken as the sensor channels (kept in column order) and
//! rows with a missing value in any of them are dropped.

use std::path::Path;

use super::{ProcessingError, RawSignal};

/// Split one CSV line, trimming whitespace and surrounding quotes.
fn split_line(line: &str) -> impl Iterator<Item = &str> {
    line.split(',').map(|field| field.trim().trim_matches('"').trim())
}

fn parse_cell(field: &str) -> Option<f64> {
    if field.is_empty() {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Non-empty lines of `text`.
fn data_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| !line.trim().is_empty())
}

/// Parse CSV bytes into a [`RawSignal`] with `channels` channels at `sample_rate`.
///
/// Two passes over the text: the first counts valid cells per column, the
/// second pushes the chosen columns straight into the channel buffers. No
/// per-row storage is kept, so peak memory is the input plus the output.
pub fn parse_signal_csv(
    bytes: &[u8],
    channels: usize,
    sample_rate: f64,
) -> Result<RawSignal, ProcessingError> {
    if channels == 0 {
        return Err(ProcessingError::InvalidConfig(
            "at least one channel is required".to_string(),
        ));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ProcessingError::MalformedCsv(format!("not valid UTF-8: {e}")))?;

    let mut valid_counts: Vec<usize> = Vec::new();
    let mut rows = 0usize;
    for line in data_lines(text) {
        rows += 1;
        for (col, field) in split_line(line).enumerate() {
            if col >= valid_counts.len() {
                valid_counts.resize(col + 1, 0);
            }
            if parse_cell(field).is_some() {
                valid_counts[col] += 1;
            }
        }
    }

    let mut ranked: Vec<usize> = (0..valid_counts.len())
        .filter(|&c| valid_counts[c] > 0)
        .collect();
    if ranked.len() < channels {
        return Err(ProcessingError::MalformedCsv(format!(
            "found {} numeric column(s), need {channels}",
            ranked.len()
        )));
    }
    // Most valid values first; ties keep the leftmost column.
    ranked.sort_by(|&a, &b| valid_counts[b].cmp(&valid_counts[a]).then(a.cmp(&b)));
    let mut chosen: Vec<usize> = ranked.into_iter().take(channels).collect();
    chosen.sort_unstable();
    let last_col = chosen[channels - 1];

    let mut data: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(rows)).collect();
    let mut row = Vec::with_capacity(channels);
    for line in data_lines(text) {
        row.clear();
        let mut next = 0;
        for (col, field) in split_line(line).enumerate().take(last_col + 1) {
            if col != chosen[next] {
                continue;
            }
            match parse_cell(field) {
                Some(value) => row.push(value as f32),
                None => break,
            }
            next += 1;
            if next == channels {
                break;
            }
        }
        // Incomplete rows are dropped.
        if row.len() == channels {
            for (channel, &value) in data.iter_mut().zip(&row) {
                channel.push(value);
            }
        }
    }

    if data[0].is_empty() {
        return Err(ProcessingError::MalformedCsv(
            "no complete numeric rows".to_string(),
        ));
    }
    for channel in &mut data {
        channel.shrink_to_fit();
    }

    RawSignal::new(sample_rate, data)
}

/// Read and parse a CSV file from disk.
pub fn read_signal_csv(
    path: &Path,
    channels: usize,
    sample_rate: f64,
) -> Result<RawSignal, ProcessingError> {
    let bytes = std::fs::read(path)?;
    parse_signal_csv(&bytes, channels, sample_rate)
}
