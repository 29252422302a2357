mod batch;
mod catalog;
mod record;
mod stream;

pub use batch::{Batch, BatchId, BatchState, EpochCounts};
pub use catalog::{Catalog, ConfiguredColumn, ConfiguredStream};
pub use record::{
    CheckpointMessage, CheckpointScope, RecordMessage, SizeHint, StreamStatus, StreamSyncSummary,
    SyncMessage,
};
pub use stream::{
    ColumnDefinition, ColumnId, ColumnType, GenerationId, StreamConfig, StreamDescriptor,
    StreamId, SyncMode,
};
