//! Test streams and messages.
//!
//! Two streams are available: `events` (`ID` integer primary key, `MSG` string, `TS` timestamp
//! cursor) and `kv` (`K` string primary key, `V` integer cursor).

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::destination::memory::MemorySqlGenerator;
use crate::destination::sql::SqlGenerator;
use crate::types::{
    Catalog, CheckpointMessage, CheckpointScope, ColumnType, ConfiguredColumn, ConfiguredStream,
    GenerationId, RecordMessage, StreamDescriptor, StreamId, StreamStatus, SyncMessage, SyncMode,
};

pub const RAW_NAMESPACE: &str = "sync_internal";
pub const DEFAULT_NAMESPACE: &str = "public";

pub const EVENTS: &str = "events";
pub const KV: &str = "kv";

fn column(name: &str, column_type: ColumnType) -> ConfiguredColumn {
    ConfiguredColumn {
        name: name.to_string(),
        column_type,
    }
}

pub fn events_stream(sync_mode: SyncMode) -> ConfiguredStream {
    ConfiguredStream {
        descriptor: descriptor(EVENTS),
        sync_mode,
        primary_key: vec!["ID".to_string()],
        cursor: Some("TS".to_string()),
        columns: vec![
            column("ID", ColumnType::Integer),
            column("MSG", ColumnType::String),
            column("TS", ColumnType::Timestamp),
        ],
        generation_id: 1,
        minimum_generation_id: 0,
        sync_id: 1,
    }
}

pub fn kv_stream(sync_mode: SyncMode) -> ConfiguredStream {
    ConfiguredStream {
        descriptor: descriptor(KV),
        sync_mode,
        primary_key: vec!["K".to_string()],
        cursor: Some("V".to_string()),
        columns: vec![column("K", ColumnType::String), column("V", ColumnType::Integer)],
        generation_id: 1,
        minimum_generation_id: 0,
        sync_id: 1,
    }
}

/// Turns a stream into a refresh of `generation_id`.
pub fn refresh(mut stream: ConfiguredStream, generation_id: GenerationId) -> ConfiguredStream {
    stream.generation_id = generation_id;
    stream.minimum_generation_id = generation_id;
    stream
}

/// Builds a catalog with the naming rules of the memory destination.
pub fn build_catalog(streams: Vec<ConfiguredStream>) -> Catalog {
    Catalog::parse(streams, &MemorySqlGenerator, RAW_NAMESPACE, DEFAULT_NAMESPACE)
        .expect("test catalog should be valid")
}

pub fn stream_id(name: &str) -> StreamId {
    MemorySqlGenerator.build_stream_id(DEFAULT_NAMESPACE, name, RAW_NAMESPACE)
}

pub fn descriptor(name: &str) -> StreamDescriptor {
    StreamDescriptor::new(Some(DEFAULT_NAMESPACE), name)
}

pub fn record(name: &str, data: Value) -> SyncMessage {
    SyncMessage::Record(RecordMessage::new(descriptor(name), data, Utc::now()))
}

pub fn record_at(name: &str, data: Value, emitted_at: DateTime<Utc>) -> SyncMessage {
    SyncMessage::Record(RecordMessage::new(descriptor(name), data, emitted_at))
}

pub fn event(id: i64, msg: &str) -> SyncMessage {
    record(
        EVENTS,
        json!({ "ID": id, "MSG": msg, "TS": Utc::now().to_rfc3339() }),
    )
}

pub fn kv(k: &str, v: i64) -> SyncMessage {
    record(KV, json!({ "K": k, "V": v }))
}

pub fn status(name: &str, status: StreamStatus) -> SyncMessage {
    SyncMessage::StreamStatus {
        stream: descriptor(name),
        status,
    }
}

pub fn complete(name: &str) -> SyncMessage {
    status(name, StreamStatus::Complete)
}

pub fn stream_checkpoint(name: &str, data: Value) -> SyncMessage {
    SyncMessage::Checkpoint(CheckpointMessage {
        scope: CheckpointScope::Stream {
            stream: descriptor(name),
        },
        data,
    })
}

pub fn global_checkpoint(data: Value) -> SyncMessage {
    SyncMessage::Checkpoint(CheckpointMessage {
        scope: CheckpointScope::Global,
        data,
    })
}
