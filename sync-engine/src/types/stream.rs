use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Generation of a stream, incremented by the platform for every refresh attempt.
pub type GenerationId = i64;

/// Identity of a stream as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub namespace: Option<String>,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Destination identity of a stream.
///
/// A stream lands in a raw table (`raw_namespace.raw_name`) and is promoted into a final table
/// (`final_namespace.final_name`). The original names are kept to resolve incoming messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub final_namespace: String,
    pub final_name: String,
    pub raw_namespace: String,
    pub raw_name: String,
    pub original_namespace: String,
    pub original_name: String,
}

impl StreamId {
    /// Returns the wire identity of this stream.
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::new(Some(&self.original_namespace), &self.original_name)
    }

    pub fn final_table(&self, suffix: &str) -> String {
        format!("{}.{}{suffix}", self.final_namespace, self.final_name)
    }

    pub fn raw_table(&self, suffix: &str) -> String {
        format!("{}.{}{suffix}", self.raw_namespace, self.raw_name)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.original_namespace, self.original_name)
    }
}

/// Destination name of a column together with the name it has in the records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnId {
    pub name: String,
    pub original_name: String,
}

/// Logical type of a final table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub id: ColumnId,
    pub column_type: ColumnType,
}

/// How records of a stream are written into its final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Records are appended.
    Append,
    /// Records are appended and deduplicated by primary key, keeping the newest by cursor.
    AppendDedup,
    /// The final table is replaced by the records of this sync.
    Overwrite,
}

/// Fully resolved configuration of one stream for one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub sync_mode: SyncMode,
    pub primary_key: Vec<ColumnId>,
    pub cursor: Option<ColumnId>,
    pub columns: Vec<ColumnDefinition>,
    pub generation_id: GenerationId,
    pub minimum_generation_id: GenerationId,
    pub sync_id: i64,
}

impl StreamConfig {
    /// Returns `true` if this sync replaces the contents of the final table.
    ///
    /// Besides [`SyncMode::Overwrite`], a refresh is signalled by a minimum generation equal to
    /// the current, non-zero generation.
    pub fn is_truncate_sync(&self) -> bool {
        self.sync_mode == SyncMode::Overwrite
            || (self.minimum_generation_id != 0
                && self.minimum_generation_id == self.generation_id)
    }

    /// Checks generation settings.
    ///
    /// Only full refreshes (`minimum_generation_id == generation_id`) and plain syncs
    /// (`minimum_generation_id == 0`) are supported.
    pub fn validate(&self) -> SyncResult<()> {
        if self.generation_id < 0 || self.minimum_generation_id < 0 {
            bail!(
                ErrorKind::ConfigError,
                "Negative generation id",
                format!("Stream {} has a negative generation id", self.id)
            );
        }

        if self.minimum_generation_id != 0 && self.minimum_generation_id != self.generation_id {
            bail!(
                ErrorKind::ConfigError,
                "Unsupported minimum generation id",
                format!(
                    "Stream {} has minimum generation id {} which is neither 0 nor its generation id {}",
                    self.id, self.minimum_generation_id, self.generation_id
                )
            );
        }

        if self.sync_mode == SyncMode::AppendDedup && self.primary_key.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Missing primary key",
                format!("Stream {} is deduplicated but has no primary key", self.id)
            );
        }

        Ok(())
    }
}
