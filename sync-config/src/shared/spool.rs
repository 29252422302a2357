use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Local spill storage configuration used while records wait to be staged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpoolConfig {
    /// Directory in which spill files are created.
    ///
    /// When not set, a `sync-spool` directory inside the system temporary directory is used.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Number of buffered bytes for a single stream after which its batch is flushed.
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: u64,
    /// Number of buffered records for a single stream after which its batch is flushed.
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
}

impl SpoolConfig {
    /// Default flush threshold, 200 MiB.
    pub const DEFAULT_FLUSH_THRESHOLD_BYTES: u64 = 200 * 1024 * 1024;

    /// Default maximum number of records in one batch.
    pub const DEFAULT_MAX_BATCH_RECORDS: usize = 100_000;

    /// Name of the directory used when [`SpoolConfig::directory`] is not set.
    pub const DEFAULT_DIRECTORY_NAME: &'static str = "sync-spool";

    /// Returns the directory in which spill files are written.
    pub fn resolved_directory(&self) -> PathBuf {
        match &self.directory {
            Some(directory) => directory.clone(),
            None => std::env::temp_dir().join(Self::DEFAULT_DIRECTORY_NAME),
        }
    }

    /// Validates spool configuration settings.
    ///
    /// Ensures both flush thresholds are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.flush_threshold_bytes == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "spool.flush_threshold_bytes".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.max_batch_records == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "spool.max_batch_records".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: None,
            flush_threshold_bytes: default_flush_threshold_bytes(),
            max_batch_records: default_max_batch_records(),
        }
    }
}

fn default_flush_threshold_bytes() -> u64 {
    SpoolConfig::DEFAULT_FLUSH_THRESHOLD_BYTES
}

fn default_max_batch_records() -> usize {
    SpoolConfig::DEFAULT_MAX_BATCH_RECORDS
}
