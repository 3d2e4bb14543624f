//! Validated-sample record store.
//!
//! Sled trees:
//! - `samples`: `{rpm}/{created_at_nanos:020}/{sha256}` → record JSON
//! - `by_time`: `{created_at_nanos:020}/{rpm}/{sha256}` → primary key
//! - `by_hash`: `{sha256}/{primary key}` → empty
//!
//! Keys sort chronologically within an RPM, so the newest record is the
//! last key under the RPM prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::StorageError;

/// One persisted, validated upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub user_id: u64,
    pub rpm: String,
    pub original_filename: String,
    pub storage_path: PathBuf,
    pub file_size_bytes: u64,
    pub sha256: String,
    pub row_count: usize,
    pub mean_val: f64,
    pub error_val: f64,
    pub created_at: DateTime<Utc>,
}

impl SampleRecord {
    fn nanos(&self) -> i64 {
        self.created_at.timestamp_nanos_opt().unwrap_or_default()
    }

    fn primary_key(&self) -> String {
        format!("{}/{:020}/{}", self.rpm, self.nanos(), self.sha256)
    }

    fn time_key(&self) -> String {
        format!("{:020}/{}/{}", self.nanos(), self.rpm, self.sha256)
    }
}

/// Sample storage backed by sled.
#[derive(Clone)]
pub struct SampleStore {
    db: Arc<sled::Db>,
    samples: sled::Tree,
    by_time: sled::Tree,
    by_hash: sled::Tree,
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("samples", &self.samples.len())
            .finish()
    }
}

impl SampleStore {
    /// Open or create the sample database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        info!(path = %path.display(), "Sample store opened");
        Self::from_db(db)
    }

    /// Open a throwaway in-memory database
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            samples: db.open_tree("samples")?,
            by_time: db.open_tree("by_time")?,
            by_hash: db.open_tree("by_hash")?,
            db: Arc::new(db),
        })
    }

    pub fn insert(&self, record: &SampleRecord) -> Result<(), StorageError> {
        let key = record.primary_key();
        let value = serde_json::to_vec(record)?;
        self.samples.insert(key.as_bytes(), value)?;
        self.by_time.insert(record.time_key().as_bytes(), key.as_bytes())?;
        self.by_hash
            .insert(format!("{}/{key}", record.sha256).as_bytes(), Vec::<u8>::new())?;

        debug!(key = %key, rpm = %record.rpm, "Stored sample record");
        Ok(())
    }

    /// Number of stored samples for `rpm`.
    pub fn count(&self, rpm: &str) -> usize {
        self.samples.scan_prefix(rpm_prefix(rpm)).count()
    }

    /// Most recent sample for `rpm`.
    pub fn latest(&self, rpm: &str) -> Result<Option<SampleRecord>, StorageError> {
        match self.samples.scan_prefix(rpm_prefix(rpm)).next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Most recent sample across all RPMs.
    pub fn latest_any(&self) -> Result<Option<SampleRecord>, StorageError> {
        let Some(entry) = self.by_time.last()? else {
            return Ok(None);
        };
        let (_, primary) = entry;
        self.get(&primary)
    }

    /// The newest `limit` samples for `rpm`, oldest first.
    pub fn recent(&self, rpm: &str, limit: usize) -> Result<Vec<SampleRecord>, StorageError> {
        let mut records = Vec::with_capacity(limit);
        for entry in self.samples.scan_prefix(rpm_prefix(rpm)).rev().take(limit) {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        records.reverse();
        Ok(records)
    }

    /// Every sample for `rpm`, oldest first.
    pub fn list(&self, rpm: &str) -> Result<Vec<SampleRecord>, StorageError> {
        self.samples
            .scan_prefix(rpm_prefix(rpm))
            .map(|entry| {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn find_by_hash(&self, sha256: &str) -> Result<Vec<SampleRecord>, StorageError> {
        let mut records = Vec::new();
        for primary in self.hash_keys(sha256)? {
            if let Some(record) = self.get(primary.as_bytes())? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Remove every record with content hash `sha256`, returning them.
    pub fn delete_by_hash(&self, sha256: &str) -> Result<Vec<SampleRecord>, StorageError> {
        let mut removed = Vec::new();
        for primary in self.hash_keys(sha256)? {
            if let Some(value) = self.samples.remove(primary.as_bytes())? {
                let record: SampleRecord = serde_json::from_slice(&value)?;
                self.by_time.remove(record.time_key().as_bytes())?;
                removed.push(record);
            }
            self.by_hash
                .remove(format!("{sha256}/{primary}").as_bytes())?;
        }
        if !removed.is_empty() {
            info!(sha256, count = removed.len(), "Deleted sample records");
        }
        Ok(removed)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, primary: &[u8]) -> Result<Option<SampleRecord>, StorageError> {
        match self.samples.get(primary)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn hash_keys(&self, sha256: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{sha256}/");
        let mut keys = Vec::new();
        for entry in self.by_hash.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = String::from_utf8_lossy(&key);
            if let Some(primary) = key.strip_prefix(&prefix) {
                keys.push(primary.to_string());
            }
        }
        Ok(keys)
    }
}

fn rpm_prefix(rpm: &str) -> Vec<u8> {
    format!("{rpm}/").into_bytes()
}
