use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::spool::SpillFile;
use crate::state::checkpoint::EpochId;
use crate::types::{StreamId, StreamStatus};

/// Sequence number of a batch within its stream, assigned in spooling order.
pub type BatchId = u64;

/// Number of records of a batch attributed to each checkpoint epoch.
pub type EpochCounts = BTreeMap<EpochId, u64>;

/// Lifecycle state of a [`Batch`].
///
/// `Pending -> Processing -> Complete`, or `Processing -> Incomplete -> Processing` when the batch
/// is requeued for more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Pending,
    Processing,
    Complete,
    Incomplete,
}

impl BatchState {
    pub fn can_transition_to(self, next: BatchState) -> bool {
        matches!(
            (self, next),
            (BatchState::Pending, BatchState::Processing)
                | (BatchState::Processing, BatchState::Complete)
                | (BatchState::Processing, BatchState::Incomplete)
                | (BatchState::Incomplete, BatchState::Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == BatchState::Complete
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Pending => "pending",
            BatchState::Processing => "processing",
            BatchState::Complete => "complete",
            BatchState::Incomplete => "incomplete",
        };
        f.write_str(name)
    }
}

/// A unit of buffered records of one stream, plus its accounting.
///
/// A batch is owned by exactly one task at a time and moved from task to task. Pending batches
/// own the spill file holding their records.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    stream_id: StreamId,
    state: BatchState,
    total_size_bytes: u64,
    record_count: u64,
    epochs: EpochCounts,
    end_of_stream: Option<StreamStatus>,
    spill: Option<SpillFile>,
}

impl Batch {
    /// Creates a pending batch backed by a spill file.
    pub(crate) fn pending(
        id: BatchId,
        stream_id: StreamId,
        spill: SpillFile,
        total_size_bytes: u64,
        record_count: u64,
        epochs: EpochCounts,
        end_of_stream: Option<StreamStatus>,
    ) -> Self {
        Self {
            id,
            stream_id,
            state: BatchState::Pending,
            total_size_bytes,
            record_count,
            epochs,
            end_of_stream,
            spill: Some(spill),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn epochs(&self) -> &EpochCounts {
        &self.epochs
    }

    /// Returns the terminal status if this batch ends its stream.
    pub fn end_of_stream(&self) -> Option<StreamStatus> {
        self.end_of_stream
    }

    pub fn spill(&self) -> Option<&SpillFile> {
        self.spill.as_ref()
    }

    /// Moves the batch to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: BatchState) -> SyncResult<()> {
        if !self.state.can_transition_to(next) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid batch state transition",
                format!(
                    "Batch {} of stream {} cannot move from {} to {}",
                    self.id, self.stream_id, self.state, next
                )
            );
        }

        debug!(stream = %self.stream_id, batch_id = self.id, from = %self.state, to = %next, "batch state changed");
        self.state = next;

        Ok(())
    }

    /// Takes ownership of the spill file, leaving the batch without one.
    pub(crate) fn take_spill(&mut self) -> Option<SpillFile> {
        self.spill.take()
    }

    /// Wraps the outcome of processing this batch into a new batch of the same stream.
    ///
    /// The batch must be processing. The result keeps the identity and checkpoint accounting, it
    /// carries `record_count` processed records and `end_of_stream` as observed while reading.
    pub fn into_result(
        self,
        state: BatchState,
        record_count: u64,
        end_of_stream: Option<StreamStatus>,
    ) -> SyncResult<Batch> {
        if self.state != BatchState::Processing || !self.state.can_transition_to(state) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid batch result state",
                format!(
                    "Batch {} of stream {} in state {} cannot produce a {} result",
                    self.id, self.stream_id, self.state, state
                )
            );
        }

        Ok(Batch {
            id: self.id,
            stream_id: self.stream_id,
            state,
            total_size_bytes: self.total_size_bytes,
            record_count,
            epochs: self.epochs,
            end_of_stream,
            spill: None,
        })
    }
}
