use std::collections::HashMap;
use std::future::Future;

use crate::destination::sql::Sql;
use crate::error::SyncResult;
use crate::state::destination::DestinationState;
use crate::state::initial::DestinationInitialStatus;
use crate::types::{StreamConfig, StreamId};

/// Executes statements against a destination and manages its per-stream state.
///
/// The handler is used during table preparation and by migrations. Unlike
/// [`crate::destination::StorageOperation`] it has no notion of stages or final tables, it only
/// runs what it is given.
pub trait DestinationHandler: Send + Sync + 'static {
    /// State persisted per stream by this destination.
    type State: DestinationState;

    /// Executes `sql`, one transaction after the other.
    fn execute(&self, sql: Sql) -> impl Future<Output = SyncResult<()>> + Send;

    /// Captures the initial status of every given stream.
    ///
    /// Streams without persisted state get the destination's default state. The returned list has
    /// one entry per stream, in the order of `streams`.
    fn gather_initial_state(
        &self,
        streams: &[StreamConfig],
    ) -> impl Future<Output = SyncResult<Vec<DestinationInitialStatus<Self::State>>>> + Send;

    /// Persists the given states, replacing whatever was stored for those streams.
    fn commit_destination_states(
        &self,
        states: HashMap<StreamId, Self::State>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
