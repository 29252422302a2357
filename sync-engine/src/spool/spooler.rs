use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use sync_config::shared::SpoolConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::spool::file::{SpillWriter, SpooledEntry};
use crate::state::checkpoint::EpochId;
use crate::types::{Batch, BatchId, EpochCounts, RecordMessage, SizeHint, StreamId, StreamStatus};

#[derive(Debug)]
struct StreamBuffer {
    batch_id: BatchId,
    writer: SpillWriter,
    size_bytes: u64,
    record_count: u64,
    epochs: EpochCounts,
}

/// Buffers incoming records per stream into spill files and cuts them into batches.
///
/// Records must be accepted in arrival order. A stream's buffer is flushed into a [`Batch`] when
/// it reaches the configured size or record count, or when the stream is completed. Any spill
/// write failure is returned as [`ErrorKind::SpoolWriteFailed`] and must fail the sync.
#[derive(Debug)]
pub struct RecordSpooler {
    directory: PathBuf,
    flush_threshold_bytes: u64,
    max_batch_records: u64,
    buffers: HashMap<StreamId, StreamBuffer>,
    next_batch_ids: HashMap<StreamId, BatchId>,
    completed: HashSet<StreamId>,
}

impl RecordSpooler {
    pub fn new(config: &SpoolConfig) -> Self {
        Self {
            directory: config.resolved_directory(),
            flush_threshold_bytes: config.flush_threshold_bytes,
            max_batch_records: config.max_batch_records as u64,
            buffers: HashMap::new(),
            next_batch_ids: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Appends a record to the buffer of its stream.
    ///
    /// Returns a batch when the buffer reached a flush threshold.
    pub async fn accept(
        &mut self,
        stream_id: &StreamId,
        record: RecordMessage,
        epoch: EpochId,
    ) -> SyncResult<Option<Batch>> {
        if self.completed.contains(stream_id) {
            bail!(
                ErrorKind::InvalidData,
                "Record received after stream status",
                format!("Stream {stream_id} already received its terminal status")
            );
        }

        let size_bytes = record.size_hint() as u64;
        let flush_threshold_bytes = self.flush_threshold_bytes;
        let max_batch_records = self.max_batch_records;

        let buffer = self.buffer(stream_id).await?;
        buffer.writer.write(&SpooledEntry::Record(record)).await?;
        buffer.size_bytes += size_bytes;
        buffer.record_count += 1;
        *buffer.epochs.entry(epoch).or_default() += 1;

        let should_flush = buffer.size_bytes >= flush_threshold_bytes
            || buffer.record_count >= max_batch_records;
        if !should_flush {
            return Ok(None);
        }

        self.flush(stream_id, None).await
    }

    /// Closes a stream with its terminal status, returning the last batch of the stream.
    ///
    /// The batch is produced even if no record was buffered since the previous flush, it carries
    /// the status sentinel.
    pub async fn complete_stream(
        &mut self,
        stream_id: &StreamId,
        status: StreamStatus,
    ) -> SyncResult<Batch> {
        if !self.completed.insert(stream_id.clone()) {
            bail!(
                ErrorKind::InvalidData,
                "Duplicate stream status",
                format!("Stream {stream_id} received more than one terminal status")
            );
        }

        let buffer = self.buffer(stream_id).await?;
        buffer.writer.write(&SpooledEntry::Status(status)).await?;

        match self.flush(stream_id, Some(status)).await? {
            Some(batch) => Ok(batch),
            None => bail!(
                ErrorKind::InvalidState,
                "Missing stream buffer",
                format!("No buffer to flush for stream {stream_id}")
            ),
        }
    }

    /// Returns `true` if the stream already received its terminal status.
    pub fn is_completed(&self, stream_id: &StreamId) -> bool {
        self.completed.contains(stream_id)
    }

    /// Flushes the buffer of a stream into a batch, if it has one.
    pub async fn flush(
        &mut self,
        stream_id: &StreamId,
        end_of_stream: Option<StreamStatus>,
    ) -> SyncResult<Option<Batch>> {
        let Some(buffer) = self.buffers.remove(stream_id) else {
            return Ok(None);
        };

        let spill = buffer.writer.finish().await?;

        info!(
            stream = %stream_id,
            batch_id = buffer.batch_id,
            records = buffer.record_count,
            size_bytes = buffer.size_bytes,
            "flushed spooled batch"
        );

        Ok(Some(Batch::pending(
            buffer.batch_id,
            stream_id.clone(),
            spill,
            buffer.size_bytes,
            buffer.record_count,
            buffer.epochs,
            end_of_stream,
        )))
    }

    /// Drops every open buffer and removes its spill file.
    pub async fn discard(&mut self) {
        for (stream_id, buffer) in self.buffers.drain() {
            if let Err(err) = buffer.writer.discard().await {
                warn!(stream = %stream_id, error = %err, "failed to discard spill file");
            }
        }
    }

    async fn buffer(&mut self, stream_id: &StreamId) -> SyncResult<&mut StreamBuffer> {
        if !self.buffers.contains_key(stream_id) {
            let next_batch_id = self.next_batch_ids.entry(stream_id.clone()).or_default();
            let batch_id = *next_batch_id;
            *next_batch_id += 1;

            let path = self.directory.join(format!(
                "{}-{}-{}.jsonl",
                stream_id.raw_name,
                batch_id,
                Uuid::new_v4()
            ));
            debug!(stream = %stream_id, batch_id, path = %path.display(), "opening spill file");

            let writer = SpillWriter::create(path).await?;
            self.buffers.insert(
                stream_id.clone(),
                StreamBuffer {
                    batch_id,
                    writer,
                    size_bytes: 0,
                    record_count: 0,
                    epochs: EpochCounts::new(),
                },
            );
        }

        match self.buffers.get_mut(stream_id) {
            Some(buffer) => Ok(buffer),
            None => bail!(
                ErrorKind::InvalidState,
                "Missing stream buffer",
                format!("No buffer was opened for stream {stream_id}")
            ),
        }
    }
}
