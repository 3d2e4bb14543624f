//! Persistent storage for validated uploads
//!
//! Sample records live in a sled database; the raw CSV copies live under
//! `validated_dir/{rpm}/`.

mod samples;

pub use samples::{SampleRecord, SampleStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
