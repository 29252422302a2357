use chrono::{DateTime, Utc};

use crate::state::destination::DestinationState;
use crate::types::StreamConfig;

/// What a raw table looked like when the sync started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialRawTableStatus {
    pub raw_table_exists: bool,
    /// Whether the raw table holds records that were never typed into the final table.
    pub has_unprocessed_records: bool,
    /// Extraction time of the newest record that was already typed, if any.
    pub max_processed_timestamp: Option<DateTime<Utc>>,
}

/// Snapshot of a stream's destination gathered once at the start of a sync.
///
/// The snapshot is read-only. A migration that invalidates it causes a fresh one to be gathered.
#[derive(Debug, Clone)]
pub struct DestinationInitialStatus<S> {
    pub stream_config: StreamConfig,
    pub is_final_table_present: bool,
    pub is_final_table_empty: bool,
    /// Whether the final table columns differ from the configured columns.
    pub is_schema_mismatch: bool,
    pub initial_raw_table_status: InitialRawTableStatus,
    pub initial_temp_raw_table_status: InitialRawTableStatus,
    pub destination_state: S,
}

impl<S> DestinationInitialStatus<S>
where
    S: DestinationState,
{
    /// Returns a copy of the snapshot carrying `destination_state`.
    pub fn with_destination_state(&self, destination_state: S) -> Self {
        Self {
            destination_state,
            ..self.clone()
        }
    }
}
