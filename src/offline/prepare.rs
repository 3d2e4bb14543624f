//! Dataset preparation: featurize every case file of one RPM, fit the
//! normalization statistics once, and persist the normalized dataset.

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

use super::OfflineError;
use crate::config::GuardConfig;
use crate::model::{read_json, write_json_atomic, ArtifactStore, FeatureCache};
use crate::processing::{read_signal_csv, FeaturePipeline, Normalizer, PreprocessConfig};

const DATASET_FILE: &str = "dataset.json";
const META_FILE: &str = "meta.json";

/// One input CSV and the zero-based case id taken from its path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaseFile {
    pub path: PathBuf,
    pub case_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// Normalized feature rows with their case ids and source files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedDataset {
    pub rpm: String,
    /// `[rows, D]`, already normalized with the stored feature cache
    pub features: Array2<f64>,
    pub case_ids: Vec<u32>,
    /// Index into `files` per row
    pub file_index: Vec<u32>,
    pub files: Vec<String>,
}

impl PreparedDataset {
    pub fn rows(&self) -> usize {
        self.features.nrows()
    }

    /// Rows whose case id is in `cases`.
    pub fn select_cases(&self, cases: &[u32]) -> Array2<f64> {
        let rows: Vec<usize> = self
            .case_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| cases.contains(*id))
            .map(|(row, _)| row)
            .collect();
        self.features.select(Axis(0), &rows)
    }

    /// Distinct case ids, ascending.
    pub fn cases(&self) -> Vec<u32> {
        let mut cases = self.case_ids.clone();
        cases.sort_unstable();
        cases.dedup();
        cases
    }
}

/// Load the prepared dataset of `rpm`.
pub fn load_dataset(artifacts: &ArtifactStore, rpm: &str) -> Result<PreparedDataset, OfflineError> {
    let path = artifacts.feature_path(rpm).join(DATASET_FILE);
    if !path.exists() {
        return Err(OfflineError::DatasetMissing {
            rpm: rpm.to_string(),
            path,
        });
    }
    Ok(read_json(&path)?)
}

/// Written next to the dataset as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareSummary {
    pub rpm: String,
    pub raw_dir: String,
    pub num_csv_files_found: usize,
    pub num_windows_total: usize,
    pub feature_dim: usize,
    pub fs_after: f64,
    pub win_samples: usize,
    pub hop_samples: usize,
    pub decim: usize,
    pub channels: usize,
    pub skipped: Vec<SkippedFile>,
}

fn case_dir_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Case(\d+)$").ok()).as_ref()
}

fn case_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Case(\d+)").ok()).as_ref()
}

/// Zero-based case id: a `CaseN` directory component wins, otherwise
/// `CaseN` anywhere in the file name. `Case0` has no id.
pub fn case_id_from_path(path: &Path) -> Option<u32> {
    let parse = |digits: &str| digits.parse::<u32>().ok()?.checked_sub(1);
    let dir_re = case_dir_regex()?;

    let from_dir = path
        .parent()
        .into_iter()
        .flat_map(Path::components)
        .filter_map(|c| c.as_os_str().to_str())
        .filter_map(|name| dir_re.captures(name))
        .last()
        .and_then(|caps| parse(&caps[1]));
    if from_dir.is_some() {
        return from_dir;
    }

    let name = path.file_name()?.to_str()?;
    case_name_regex()?
        .captures(name)
        .and_then(|caps| parse(&caps[1]))
}

/// Every `*.csv` below `raw_dir/Case*/`, sorted by path.
pub fn discover_case_files(raw_dir: &Path) -> Result<(Vec<CaseFile>, Vec<SkippedFile>), OfflineError> {
    let mut csvs = Vec::new();
    for entry in std::fs::read_dir(raw_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_dir()
            && name.to_str().is_some_and(|n| n.starts_with("Case"))
        {
            collect_csvs(&entry.path(), &mut csvs)?;
        }
    }
    csvs.sort();

    let mut files = Vec::with_capacity(csvs.len());
    let mut skipped = Vec::new();
    for path in csvs {
        match case_id_from_path(&path) {
            Some(case_id) => files.push(CaseFile { path, case_id }),
            None => skipped.push(SkippedFile {
                path: path.display().to_string(),
                reason: "no case id in path".to_string(),
            }),
        }
    }
    Ok((files, skipped))
}

fn collect_csvs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), OfflineError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_csvs(&path, out)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Prepare the dataset of `rpm` from `raw_dir`.
pub fn prepare(
    raw_dir: &Path,
    rpm: &str,
    config: &GuardConfig,
    artifacts: &ArtifactStore,
) -> Result<PrepareSummary, OfflineError> {
    let settings = config.preprocess_for(rpm);
    let preprocess = PreprocessConfig::from_settings(settings)?;
    let pipeline = FeaturePipeline::new(preprocess)?.with_max_windows(settings.max_windows_per_file);

    let (files, mut skipped) = discover_case_files(raw_dir)?;
    let found = files.len() + skipped.len();
    if found == 0 {
        return Err(OfflineError::NoInputs(raw_dir.to_path_buf()));
    }
    info!(
        rpm,
        files = files.len(),
        decim = preprocess.decimation_factor,
        win = preprocess.window_samples,
        hop = preprocess.hop_samples,
        "Preparing dataset"
    );

    let results: Vec<_> = files
        .par_iter()
        .map(|file| {
            read_signal_csv(&file.path, preprocess.channels, preprocess.source_rate)
                .and_then(|signal| pipeline.extract(&signal))
        })
        .collect();

    let mut blocks = Vec::new();
    let mut case_ids = Vec::new();
    let mut file_index = Vec::new();
    let mut used_files = Vec::new();
    for (file, result) in files.iter().zip(results) {
        match result {
            Ok(block) => {
                let index = used_files.len() as u32;
                case_ids.extend(std::iter::repeat(file.case_id).take(block.nrows()));
                file_index.extend(std::iter::repeat(index).take(block.nrows()));
                used_files.push(file.path.display().to_string());
                blocks.push(block);
            }
            Err(e) => {
                let reason = e.skip_reason();
                warn!(path = %file.path.display(), reason = %reason, "Skipping input file");
                skipped.push(SkippedFile {
                    path: file.path.display().to_string(),
                    reason,
                });
            }
        }
    }

    if blocks.is_empty() {
        return Err(OfflineError::NoUsableWindows {
            skipped: skipped.len(),
        });
    }
    let views: Vec<ArrayView2<f64>> = blocks.iter().map(Array2::view).collect();
    let raw = concatenate(Axis(0), &views).map_err(|e| {
        OfflineError::Processing(crate::processing::ProcessingError::InvalidConfig(format!(
            "feature blocks disagree: {e}"
        )))
    })?;

    let normalizer = Normalizer::fit(&raw)?;
    let features = normalizer.transform(&raw)?;
    let cache = FeatureCache::from_parts(rpm, &preprocess, normalizer.stats());
    artifacts.save_feature_cache(&cache)?;

    let summary = PrepareSummary {
        rpm: rpm.to_string(),
        raw_dir: raw_dir.display().to_string(),
        num_csv_files_found: found,
        num_windows_total: features.nrows(),
        feature_dim: features.ncols(),
        fs_after: preprocess.target_rate,
        win_samples: preprocess.window_samples,
        hop_samples: preprocess.hop_samples,
        decim: preprocess.decimation_factor,
        channels: preprocess.channels,
        skipped,
    };
    let dataset = PreparedDataset {
        rpm: rpm.to_string(),
        features,
        case_ids,
        file_index,
        files: used_files,
    };

    let out_dir = artifacts.feature_path(rpm);
    write_json_atomic(&out_dir.join(DATASET_FILE), &dataset)?;
    write_json_atomic(&out_dir.join(META_FILE), &summary)?;

    info!(
        rpm,
        windows = summary.num_windows_total,
        feature_dim = summary.feature_dim,
        cases = ?dataset.cases(),
        skipped = summary.skipped.len(),
        "Dataset prepared"
    );
    Ok(summary)
}
