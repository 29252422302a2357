use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::StreamDescriptor;

/// Reports an approximate size in bytes, used for flush thresholds.
pub trait SizeHint {
    fn size_hint(&self) -> usize;
}

/// A single record emitted by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: StreamDescriptor,
    pub data: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
    /// Size of the serialized record as received, in bytes.
    pub size_bytes: usize,
}

impl RecordMessage {
    /// Builds a record, measuring its serialized size.
    pub fn new(stream: StreamDescriptor, data: serde_json::Value, emitted_at: DateTime<Utc>) -> Self {
        let size_bytes = data.to_string().len();
        Self {
            stream,
            data,
            emitted_at,
            size_bytes,
        }
    }
}

impl SizeHint for RecordMessage {
    fn size_hint(&self) -> usize {
        self.size_bytes
    }
}

/// Terminal status reported by the source for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Complete,
    Incomplete,
}

/// What a checkpoint covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointScope {
    /// Covers the records of a single stream.
    Stream { stream: StreamDescriptor },
    /// Covers the records of every stream.
    Global,
}

/// An opaque source checkpoint that may be acknowledged once everything before it is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub scope: CheckpointScope,
    pub data: serde_json::Value,
}

/// A message of the ingestion stream, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Record(RecordMessage),
    Checkpoint(CheckpointMessage),
    StreamStatus {
        stream: StreamDescriptor,
        status: StreamStatus,
    },
}

/// Per-stream outcome of a sync, as seen by the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSyncSummary {
    /// Number of records written to the stage during this sync.
    pub records_written: u64,
    pub terminal_status: StreamStatus,
}
