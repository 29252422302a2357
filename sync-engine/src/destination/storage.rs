use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::types::{GenerationId, RecordMessage, StreamConfig, StreamId};

/// Suffix of the stage or final table holding the real data.
pub const NO_SUFFIX: &str = "";

/// Suffix of the temporary stage and final table used by truncate syncs.
pub const TMP_TABLE_SUFFIX: &str = "_sync_tmp";

/// Suffix of the table a final table is rebuilt into during a soft reset.
pub const SOFT_RESET_SUFFIX: &str = "_sync_soft_reset";

/// Stage and final table lifecycle of a destination.
///
/// This is the only abstraction through which the engine writes persistent data. Stages are
/// addressed by stream and suffix, where [`NO_SUFFIX`] denotes the real stage. Implementations own
/// retries of transient failures, the engine treats every returned error as fatal for the stream.
///
/// [`StorageOperation::overwrite_stage`] and [`StorageOperation::overwrite_final_table`] must be
/// atomic: after they return the replacement is fully visible, if they fail nothing changed.
pub trait StorageOperation: Send + Sync + 'static {
    /// Creates the stage `suffix` of a stream if missing, or recreates it empty when `replace`.
    fn prepare_stage(
        &self,
        stream_id: &StreamId,
        suffix: &str,
        replace: bool,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Replaces the real stage with the stage `tmp_suffix`, which is consumed.
    fn overwrite_stage(
        &self,
        stream_id: &StreamId,
        tmp_suffix: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Moves the records of the stage `tmp_suffix` into the real stage and drops it.
    fn transfer_from_temp_stage(
        &self,
        stream_id: &StreamId,
        tmp_suffix: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the generation of the records in stage `suffix`, or `None` if the stage is
    /// missing or empty.
    fn get_stage_generation(
        &self,
        stream_id: &StreamId,
        suffix: &str,
    ) -> impl Future<Output = SyncResult<Option<GenerationId>>> + Send;

    /// Releases transient resources used while staging the stream.
    fn cleanup_stage(&self, stream_id: &StreamId) -> impl Future<Output = SyncResult<()>> + Send;

    /// Appends records to the stage `suffix`.
    fn write_to_stage(
        &self,
        stream: &StreamConfig,
        suffix: &str,
        records: Vec<RecordMessage>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Creates the final table `suffix`.
    ///
    /// Fails if the table exists and `replace` is `false`.
    fn create_final_table(
        &self,
        stream: &StreamConfig,
        suffix: &str,
        replace: bool,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Rebuilds the real final table from every record of the real stage, keeping the table.
    fn soft_reset_final_table(
        &self,
        stream: &StreamConfig,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Replaces the real final table with the final table `tmp_suffix`, which is consumed.
    fn overwrite_final_table(
        &self,
        stream_id: &StreamId,
        tmp_suffix: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Types the untyped records of the real stage into the final table `final_suffix`.
    ///
    /// Only records extracted after `max_processed_timestamp` are considered, when given.
    fn type_and_dedupe(
        &self,
        stream: &StreamConfig,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
