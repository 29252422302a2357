use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::destination::NO_SUFFIX;
use crate::error::{SyncError, SyncResult};
use crate::state::initial::InitialRawTableStatus;
use crate::typing::lock::RawTableLock;
use crate::types::{StreamId, StreamSyncSummary};

/// Failures of individual streams, keyed by stream.
pub type StreamFailures = HashMap<StreamId, SyncError>;

/// Typing progress of one stream.
///
/// Phases only move forward. `SoftReset` is skipped by streams that need no soft reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypingPhase {
    Unprepared,
    SchemaPrepared,
    SoftReset,
    TypedAndDeduped,
    FinalCommitted,
}

impl fmt::Display for TypingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprepared => write!(f, "unprepared"),
            Self::SchemaPrepared => write!(f, "schema_prepared"),
            Self::SoftReset => write!(f, "soft_reset"),
            Self::TypedAndDeduped => write!(f, "typed_and_deduped"),
            Self::FinalCommitted => write!(f, "final_committed"),
        }
    }
}

/// What table preparation decided for a stream, used to set up its loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStream {
    pub raw_table_status: InitialRawTableStatus,
    pub temp_raw_table_status: InitialRawTableStatus,
    /// Suffix of the final table records of this sync are typed into.
    pub final_table_suffix: String,
}

impl Default for PreparedStream {
    fn default() -> Self {
        Self {
            raw_table_status: InitialRawTableStatus::default(),
            temp_raw_table_status: InitialRawTableStatus::default(),
            final_table_suffix: NO_SUFFIX.to_string(),
        }
    }
}

/// Prepares destination tables and promotes staged records into final tables.
///
/// A sync calls [`TyperDeduper::prepare_tables`] once before staging, then
/// [`TyperDeduper::type_and_dedupe`] any number of times per stream, then
/// [`TyperDeduper::commit_final_tables`] once and finally [`TyperDeduper::cleanup`].
pub trait TyperDeduper: Send + Sync + 'static {
    /// Gathers the initial state of every stream, creates missing namespaces in one batch of
    /// statements, runs migrations and persists the resulting states.
    ///
    /// A namespace creation failure fails the sync. A migration failure only fails its stream.
    fn prepare_schemas_and_run_migrations(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Creates missing final tables and decides, per stream, which final table is written and
    /// whether a soft reset is pending.
    fn prepare_final_tables(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Runs [`TyperDeduper::prepare_schemas_and_run_migrations`] then
    /// [`TyperDeduper::prepare_final_tables`].
    fn prepare_tables(&self) -> impl Future<Output = SyncResult<()>> + Send {
        async move {
            self.prepare_schemas_and_run_migrations().await?;
            self.prepare_final_tables().await
        }
    }

    /// Returns the preparation result of a stream, or the error that failed its preparation.
    fn prepared_stream(
        &self,
        stream_id: &StreamId,
    ) -> impl Future<Output = SyncResult<PreparedStream>> + Send;

    /// Types and dedupes the untyped records of a stream into its final table `final_suffix`.
    ///
    /// Runs a pending soft reset first, at most once per sync. Holds the stream's raw table lock
    /// exclusively for the whole call.
    fn type_and_dedupe(
        &self,
        stream_id: &StreamId,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Commits the final tables of the given streams at the end of a sync.
    ///
    /// Returns the streams that failed to commit. An error is returned only for failures that
    /// affect the whole sync.
    fn commit_final_tables(
        &self,
        summaries: &HashMap<StreamId, StreamSyncSummary>,
    ) -> impl Future<Output = SyncResult<StreamFailures>> + Send;

    /// Shuts down the typing worker pool. Calling it more than once is harmless.
    fn cleanup(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the lock record processing must hold while inserting into a stream's raw table.
    fn raw_table_insert_lock(&self, stream_id: &StreamId) -> SyncResult<RawTableLock>;

    /// Returns `false` if this typer never writes final tables.
    fn supports_typing(&self) -> bool {
        true
    }
}
