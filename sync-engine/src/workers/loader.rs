use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::destination::{NO_SUFFIX, StorageOperation, TMP_TABLE_SUFFIX};
use crate::error::{ErrorKind, SyncResult};
use crate::spool::SpooledRecords;
use crate::types::{StreamConfig, StreamId, StreamStatus, StreamSyncSummary};
use crate::typing::{PreparedStream, RawTableLock, TyperDeduper};

/// Stages the records of one stream and runs its typing passes.
///
/// A loader is created once per stream after table preparation. Normal syncs stage into the real
/// raw table. Truncate syncs stage into the temp raw table, which replaces the real one when the
/// stream closes complete.
#[derive(Debug)]
pub struct StreamLoader<S, T> {
    stream: StreamConfig,
    storage: Arc<S>,
    typer: Arc<T>,
    prepared: PreparedStream,
    lock: RawTableLock,
    stage_suffix: &'static str,
    retained_unprocessed_temp_records: bool,
    stage_write_batch_size: usize,
}

impl<S, T> StreamLoader<S, T>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    /// Sets up the stream's raw tables and returns its loader.
    pub async fn start(
        stream: StreamConfig,
        storage: Arc<S>,
        typer: Arc<T>,
        stage_write_batch_size: usize,
    ) -> SyncResult<Self> {
        let prepared = typer.prepared_stream(&stream.id).await?;
        let lock = typer.raw_table_insert_lock(&stream.id)?;

        let (stage_suffix, retained_unprocessed_temp_records) = if stream.is_truncate_sync() {
            let generation = storage
                .get_stage_generation(&stream.id, TMP_TABLE_SUFFIX)
                .await?;
            let discard = generation.is_some_and(|generation| generation != stream.generation_id);

            if discard {
                info!(
                    stream = %stream.id,
                    stale_generation = generation,
                    generation = stream.generation_id,
                    "discarding temp stage of a previous generation"
                );
            }
            storage
                .prepare_stage(&stream.id, TMP_TABLE_SUFFIX, discard)
                .await?;

            (
                TMP_TABLE_SUFFIX,
                !discard && prepared.temp_raw_table_status.has_unprocessed_records,
            )
        } else {
            storage.prepare_stage(&stream.id, NO_SUFFIX, false).await?;
            if prepared.temp_raw_table_status.raw_table_exists {
                storage
                    .transfer_from_temp_stage(&stream.id, TMP_TABLE_SUFFIX)
                    .await?;
            }

            (NO_SUFFIX, false)
        };

        debug!(
            stream = %stream.id,
            stage = stream.id.raw_table(stage_suffix),
            final_table = stream.id.final_table(&prepared.final_table_suffix),
            "stream loader started"
        );

        Ok(Self {
            stream,
            storage,
            typer,
            prepared,
            lock,
            stage_suffix,
            retained_unprocessed_temp_records,
            stage_write_batch_size,
        })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream.id
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// Returns `true` if staged records may be typed before the stream closes.
    pub fn types_incrementally(&self) -> bool {
        self.typer.supports_typing() && !self.stream.is_truncate_sync()
    }

    /// Writes records to the stage in chunks, holding the raw table lock for each chunk.
    ///
    /// Returns the number of records written.
    pub async fn write_records(
        &self,
        records: &mut SpooledRecords,
        shutdown_rx: &mut ShutdownRx,
    ) -> SyncResult<u64> {
        let mut written = 0;

        loop {
            let chunk = records.next_chunk(self.stage_write_batch_size).await?;
            if chunk.is_empty() {
                break;
            }

            let _guard = match self.lock.lock_interruptibly(shutdown_rx).await {
                ShutdownResult::Ok(guard) => guard,
                ShutdownResult::Shutdown(()) => bail!(
                    ErrorKind::SyncCancelled,
                    "Sync cancelled while staging records",
                    format!("Staging of stream {} was interrupted", self.stream.id)
                ),
            };

            let count = chunk.len() as u64;
            self.storage
                .write_to_stage(&self.stream, self.stage_suffix, chunk)
                .await?;
            written += count;
        }

        Ok(written)
    }

    /// Runs a typing pass over the records staged so far.
    pub async fn type_incrementally(&self) -> SyncResult<()> {
        self.typer
            .type_and_dedupe(
                &self.stream.id,
                self.max_processed_timestamp(),
                &self.prepared.final_table_suffix,
            )
            .await
    }

    /// Finalizes the stream's raw tables and types whatever is left.
    pub async fn close(&self, summary: StreamSyncSummary) -> SyncResult<()> {
        self.storage.cleanup_stage(&self.stream.id).await?;

        let should_type = if self.stream.is_truncate_sync() {
            if summary.terminal_status == StreamStatus::Incomplete {
                info!(stream = %self.stream.id, "refresh did not complete, keeping previous raw table");
                return Ok(());
            }

            {
                let _guard = self.lock.lock_exclusive().await;
                self.storage
                    .overwrite_stage(&self.stream.id, TMP_TABLE_SUFFIX)
                    .await?;
            }

            summary.records_written > 0 || self.retained_unprocessed_temp_records
        } else {
            summary.records_written > 0
                || self.prepared.raw_table_status.has_unprocessed_records
                || self.prepared.temp_raw_table_status.has_unprocessed_records
        };

        if !should_type {
            info!(stream = %self.stream.id, "no records to type, skipping final typing pass");
            return Ok(());
        }

        self.typer
            .type_and_dedupe(
                &self.stream.id,
                self.max_processed_timestamp(),
                &self.prepared.final_table_suffix,
            )
            .await
    }

    /// Only records extracted after this time are typed.
    fn max_processed_timestamp(&self) -> Option<DateTime<Utc>> {
        let temp = self.prepared.temp_raw_table_status.max_processed_timestamp;
        if self.stream.is_truncate_sync() {
            return temp;
        }

        let real = self.prepared.raw_table_status.max_processed_timestamp;
        match (real, temp) {
            (Some(real), Some(temp)) => Some(real.min(temp)),
            (real, temp) => real.or(temp),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use sync_config::shared::TypingConfig;
    use sync_telemetry::init_test_tracing;

    use super::*;
    use crate::destination::memory::{MemoryDestination, MemorySqlGenerator};
    use crate::migration::Migrator;
    use crate::state::destination::MinimumDestinationState;
    use crate::test_utils::catalog::{KV, build_catalog, kv_stream, stream_id};
    use crate::test_utils::storage::{StorageCall, TestStorageWrapper};
    use crate::types::{RecordMessage, SyncMode};
    use crate::typing::DefaultTyperDeduper;

    type Destination = TestStorageWrapper<MemoryDestination<MinimumDestinationState>>;

    fn kv_record(stream: &StreamConfig, k: &str, v: i64, emitted_at: DateTime<Utc>) -> RecordMessage {
        RecordMessage::new(stream.id.descriptor(), json!({ "K": k, "V": v }), emitted_at)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn normal_sync_filters_by_the_real_raw_table_timestamp_without_temp_table() {
        init_test_tracing();
        let destination: Destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let catalog = Arc::new(build_catalog(vec![kv_stream(SyncMode::AppendDedup)]));
        let kv_id = stream_id(KV);
        let stream = catalog.stream_by_id(&kv_id).unwrap().clone();

        let processed_at = Utc::now() - Duration::minutes(5);
        let memory = destination.wrapped();
        memory.create_final_table(&stream, NO_SUFFIX, false).await.unwrap();
        memory.prepare_stage(&kv_id, NO_SUFFIX, false).await.unwrap();
        memory
            .write_to_stage(&stream, NO_SUFFIX, vec![kv_record(&stream, "a", 1, processed_at)])
            .await
            .unwrap();
        memory.type_and_dedupe(&stream, None, NO_SUFFIX).await.unwrap();
        memory
            .write_to_stage(&stream, NO_SUFFIX, vec![kv_record(&stream, "b", 2, Utc::now())])
            .await
            .unwrap();

        let typer = Arc::new(DefaultTyperDeduper::new(
            destination.clone(),
            destination.clone(),
            Arc::new(MemorySqlGenerator),
            Migrator::empty(),
            catalog,
            &TypingConfig {
                max_workers: 1,
                incremental_interval_ms: None,
            },
        ));
        typer.prepare_tables().await.unwrap();

        let loader = StreamLoader::start(stream, Arc::new(destination.clone()), typer, 10)
            .await
            .unwrap();
        loader
            .close(StreamSyncSummary {
                records_written: 0,
                terminal_status: StreamStatus::Complete,
            })
            .await
            .unwrap();

        let typing_calls = destination
            .count_calls(&kv_id, |call| {
                *call
                    == StorageCall::TypeAndDedupe {
                        final_suffix: NO_SUFFIX.to_string(),
                        max_processed_timestamp: Some(processed_at),
                    }
            })
            .await;
        assert_eq!(typing_calls, 1);
        assert_eq!(destination.wrapped().final_rows(&kv_id).await.len(), 2);
    }
}
