//! Per-case batch scoring against a trained bundle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use super::prepare::PreparedDataset;
use super::OfflineError;
use crate::model::{BatchVerdict, FrozenAutoencoder, ModelError};

/// Batch verdict of one case, ranked by `err_p95`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseScore {
    pub case_id: u32,
    pub case_name: String,
    #[serde(flatten)]
    pub verdict: BatchVerdict,
}

/// Score every case of an already-normalized dataset, most suspicious first.
pub fn score_cases(
    dataset: &PreparedDataset,
    network: &FrozenAutoencoder,
    threshold: f64,
) -> Result<Vec<CaseScore>, OfflineError> {
    let errors = network.reconstruction_errors(&dataset.features)?;

    let mut by_case: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (&case_id, &error) in dataset.case_ids.iter().zip(errors.iter()) {
        by_case.entry(case_id).or_default().push(error);
    }

    let mut scores = by_case
        .into_iter()
        .map(|(case_id, errs)| {
            let verdict = BatchVerdict::from_errors(&errs, threshold).ok_or_else(|| {
                ModelError::InvalidModel(format!("case {case_id} has no windows"))
            })?;
            Ok(CaseScore {
                case_id,
                case_name: format!("Case{}", case_id + 1),
                verdict,
            })
        })
        .collect::<Result<Vec<_>, OfflineError>>()?;
    scores.sort_by(|a, b| b.verdict.err_p95.total_cmp(&a.verdict.err_p95));

    if let Some(top) = scores.first() {
        info!(
            cases = scores.len(),
            anomalous = scores.iter().filter(|s| s.verdict.is_anomaly).count(),
            top_case = %top.case_name,
            top_p95 = top.verdict.err_p95,
            "Cases scored"
        );
    }
    Ok(scores)
}

/// Write scores as CSV with a header row; `is_anomaly` is 0/1.
pub fn write_case_scores_csv(path: &Path, scores: &[CaseScore]) -> Result<(), OfflineError> {
    let mut out = String::from("case_id,case_name,windows,err_mean,err_p95,err_p99,is_anomaly\n");
    for s in scores {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            s.case_id,
            s.case_name,
            s.verdict.windows,
            s.verdict.err_mean,
            s.verdict.err_p95,
            s.verdict.err_p99,
            u8::from(s.verdict.is_anomaly)
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, DenseLayer};
    use ndarray::{array, Array1, Array2};

    /// Reconstructs every input as zero, so a row's error is its mean square.
    fn zero_network(dim: usize) -> FrozenAutoencoder {
        FrozenAutoencoder::new(vec![DenseLayer {
            weights: Array2::zeros((dim, dim)),
            bias: Array1::zeros(dim),
            activation: Activation::Identity,
        }])
        .expect("network")
    }

    fn dataset() -> PreparedDataset {
        PreparedDataset {
            rpm: "800".to_string(),
            features: array![[0.1, 0.1], [0.2, 0.2], [3.0, 3.0], [2.0, 2.0], [0.0, 0.0]],
            case_ids: vec![0, 0, 1, 1, 2],
            file_index: vec![0, 0, 1, 1, 2],
            files: vec!["a".into(), "b".into(), "c".into()],
        }
    }

    #[test]
    fn test_scores_sorted_by_p95() {
        let scores = score_cases(&dataset(), &zero_network(2), 1.0).expect("score");
        let names: Vec<&str> = scores.iter().map(|s| s.case_name.as_str()).collect();
        assert_eq!(names, vec!["Case2", "Case1", "Case3"]);
        assert!(scores[0].verdict.is_anomaly);
        assert!(!scores[1].verdict.is_anomaly);
        assert_eq!(scores[0].verdict.windows, 2);
    }

    #[test]
    fn test_csv_output() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("out").join("scores_by_case.csv");
        let scores = score_cases(&dataset(), &zero_network(2), 1.0).expect("score");
        write_case_scores_csv(&path, &scores).expect("write");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("case_id,case_name"));
        assert!(lines[1].starts_with("1,Case2,2,"));
        assert!(lines[1].ends_with(",1"));
    }
}
