use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{SpoolConfig, TypingConfig, ValidationError};

/// Configuration for a destination sync.
///
/// Contains the settings that bound buffering, staging and the worker pools of a sync. Every
/// field has a default so an empty document deserializes into a usable configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Spill storage configuration.
    #[serde(default)]
    pub spool: SpoolConfig,
    /// Typing and deduplication configuration.
    #[serde(default)]
    pub typing: TypingConfig,
    /// Maximum number of stream tasks (record processing, typing, close) that run at a time.
    #[serde(default = "default_max_processing_workers")]
    pub max_processing_workers: u16,
    /// Maximum number of records handed to the destination in one stage write.
    #[serde(default = "default_stage_write_batch_size")]
    pub stage_write_batch_size: usize,
    /// Namespace holding the raw tables of every stream.
    #[serde(default = "default_raw_namespace")]
    pub raw_namespace: String,
    /// Namespace used for streams that do not declare one.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
}

impl SyncConfig {
    /// Default number of concurrent stream tasks.
    pub const DEFAULT_MAX_PROCESSING_WORKERS: u16 = 4;

    /// Default number of records per stage write.
    pub const DEFAULT_STAGE_WRITE_BATCH_SIZE: usize = 1_000;

    /// Default raw namespace.
    pub const DEFAULT_RAW_NAMESPACE: &'static str = "sync_internal";

    /// Default namespace for streams without one.
    pub const DEFAULT_NAMESPACE: &'static str = "public";

    /// Validates sync configuration settings, including nested sections.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.spool.validate()?;
        self.typing.validate()?;

        if self.max_processing_workers == 0 {
            return Err(ValidationError::MaxProcessingWorkersZero);
        }

        if self.stage_write_batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "stage_write_batch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        for (field, value) in [
            ("raw_namespace", &self.raw_namespace),
            ("default_namespace", &self.default_namespace),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_string(),
                    constraint: "must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            spool: SpoolConfig::default(),
            typing: TypingConfig::default(),
            max_processing_workers: default_max_processing_workers(),
            stage_write_batch_size: default_stage_write_batch_size(),
            raw_namespace: default_raw_namespace(),
            default_namespace: default_namespace(),
        }
    }
}

impl Config for SyncConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn default_max_processing_workers() -> u16 {
    SyncConfig::DEFAULT_MAX_PROCESSING_WORKERS
}

fn default_stage_write_batch_size() -> usize {
    SyncConfig::DEFAULT_STAGE_WRITE_BATCH_SIZE
}

fn default_raw_namespace() -> String {
    SyncConfig::DEFAULT_RAW_NAMESPACE.to_string()
}

fn default_namespace() -> String {
    SyncConfig::DEFAULT_NAMESPACE.to_string()
}
