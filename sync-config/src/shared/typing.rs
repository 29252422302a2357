use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of the typing and deduplication stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TypingConfig {
    /// Maximum number of streams that are prepared, migrated or typed at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: u16,
    /// Minimum time, in milliseconds, between two mid-sync typing passes of the same stream.
    ///
    /// Mid-sync typing is disabled when not set, in which case typing runs only when a stream
    /// is closed.
    #[serde(default)]
    pub incremental_interval_ms: Option<u64>,
}

impl TypingConfig {
    /// Default size of the typing worker pool.
    pub const DEFAULT_MAX_WORKERS: u16 = 8;

    /// Returns the mid-sync typing interval, if enabled.
    pub fn incremental_interval(&self) -> Option<Duration> {
        self.incremental_interval_ms.map(Duration::from_millis)
    }

    /// Validates typing configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_workers == 0 {
            return Err(ValidationError::MaxTypingWorkersZero);
        }

        Ok(())
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            incremental_interval_ms: None,
        }
    }
}

fn default_max_workers() -> u16 {
    TypingConfig::DEFAULT_MAX_WORKERS
}
