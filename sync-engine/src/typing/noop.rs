use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::types::{StreamId, StreamSyncSummary};
use crate::typing::base::{PreparedStream, StreamFailures, TyperDeduper};
use crate::typing::lock::RawTableLock;

/// [`TyperDeduper`] for destinations that only keep raw stages.
///
/// Every operation succeeds without touching the destination, and raw table locks provide no
/// exclusion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTyperDeduper;

impl NoOpTyperDeduper {
    pub fn new() -> Self {
        Self
    }
}

impl TyperDeduper for NoOpTyperDeduper {
    async fn prepare_schemas_and_run_migrations(&self) -> SyncResult<()> {
        info!("skipping schema preparation, destination does not type records");
        Ok(())
    }

    async fn prepare_final_tables(&self) -> SyncResult<()> {
        info!("skipping final table preparation, destination does not type records");
        Ok(())
    }

    async fn prepared_stream(&self, _stream_id: &StreamId) -> SyncResult<PreparedStream> {
        Ok(PreparedStream::default())
    }

    async fn type_and_dedupe(
        &self,
        stream_id: &StreamId,
        _max_processed_timestamp: Option<DateTime<Utc>>,
        _final_suffix: &str,
    ) -> SyncResult<()> {
        debug!(stream = %stream_id, "skipping typing and deduping");
        Ok(())
    }

    async fn commit_final_tables(
        &self,
        _summaries: &HashMap<StreamId, StreamSyncSummary>,
    ) -> SyncResult<StreamFailures> {
        info!("skipping final table commit, destination does not type records");
        Ok(StreamFailures::new())
    }

    async fn cleanup(&self) -> SyncResult<()> {
        Ok(())
    }

    fn raw_table_insert_lock(&self, _stream_id: &StreamId) -> SyncResult<RawTableLock> {
        Ok(RawTableLock::Noop)
    }

    fn supports_typing(&self) -> bool {
        false
    }
}
