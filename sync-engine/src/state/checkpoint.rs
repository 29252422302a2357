use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{CheckpointMessage, EpochCounts, StreamId};

/// Identifier of the span of records of one stream between two checkpoints.
pub type EpochId = u64;

/// A source checkpoint whose records are all durably staged.
#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgedCheckpoint {
    pub checkpoint: CheckpointMessage,
    /// Number of records received since the previous checkpoint of the same scope.
    pub record_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointMode {
    Stream,
    Global,
}

#[derive(Debug)]
struct PendingCheckpoint {
    checkpoint: CheckpointMessage,
    epochs: Vec<EpochId>,
    record_count: u64,
}

/// Decides when source checkpoints can be acknowledged.
///
/// Every record is attributed to the open epoch of its stream. A checkpoint closes epochs and is
/// acknowledged once no record of those epochs, nor of any checkpoint before it in the same
/// queue, is still waiting to be staged.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    mode: Option<CheckpointMode>,
    next_epoch: EpochId,
    open_epochs: HashMap<StreamId, EpochId>,
    outstanding: HashMap<EpochId, u64>,
    received: HashMap<EpochId, u64>,
    stream_queues: HashMap<StreamId, VecDeque<PendingCheckpoint>>,
    global_queue: VecDeque<PendingCheckpoint>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes one record of `stream_id` to its open epoch, opening one if needed.
    pub fn register_record(&mut self, stream_id: &StreamId) -> EpochId {
        let epoch = match self.open_epochs.get(stream_id) {
            Some(epoch) => *epoch,
            None => {
                let epoch = self.next_epoch;
                self.next_epoch += 1;
                self.open_epochs.insert(stream_id.clone(), epoch);
                epoch
            }
        };

        *self.outstanding.entry(epoch).or_default() += 1;
        *self.received.entry(epoch).or_default() += 1;

        epoch
    }

    /// Tracks a checkpoint covering the records of `stream_id` received so far.
    pub fn track_stream_checkpoint(
        &mut self,
        stream_id: &StreamId,
        checkpoint: CheckpointMessage,
    ) -> SyncResult<()> {
        self.set_mode(CheckpointMode::Stream)?;

        let epochs: Vec<EpochId> = self.open_epochs.remove(stream_id).into_iter().collect();
        let pending = self.pending(checkpoint, epochs);

        debug!(stream = %stream_id, records = pending.record_count, "tracking stream checkpoint");

        self.stream_queues
            .entry(stream_id.clone())
            .or_default()
            .push_back(pending);

        Ok(())
    }

    /// Tracks a checkpoint covering the records of every stream received so far.
    pub fn track_global_checkpoint(&mut self, checkpoint: CheckpointMessage) -> SyncResult<()> {
        self.set_mode(CheckpointMode::Global)?;

        let epochs: Vec<EpochId> = self.open_epochs.drain().map(|(_, epoch)| epoch).collect();
        let pending = self.pending(checkpoint, epochs);

        debug!(records = pending.record_count, "tracking global checkpoint");

        self.global_queue.push_back(pending);

        Ok(())
    }

    /// Marks records of the given epochs as durably staged.
    pub fn complete_records(&mut self, counts: &EpochCounts) -> SyncResult<()> {
        for (epoch, count) in counts {
            let Some(outstanding) = self.outstanding.get_mut(epoch) else {
                bail!(
                    ErrorKind::InvalidState,
                    "Unknown checkpoint epoch",
                    format!("Completed {count} records of epoch {epoch} which is not tracked")
                );
            };

            let Some(remaining) = outstanding.checked_sub(*count) else {
                bail!(
                    ErrorKind::InvalidState,
                    "Checkpoint counter underflow",
                    format!(
                        "Completed {count} records of epoch {epoch} but only {outstanding} are outstanding"
                    )
                );
            };

            *outstanding = remaining;
        }

        Ok(())
    }

    /// Removes and returns every checkpoint that can be acknowledged, in arrival order per queue.
    pub fn drain_acknowledged(&mut self) -> Vec<AcknowledgedCheckpoint> {
        let mut acknowledged = Vec::new();

        let outstanding = &mut self.outstanding;
        let received = &mut self.received;
        let queues = self
            .stream_queues
            .values_mut()
            .chain(std::iter::once(&mut self.global_queue));

        for queue in queues {
            while let Some(front) = queue.front() {
                let done = front
                    .epochs
                    .iter()
                    .all(|epoch| outstanding.get(epoch).copied().unwrap_or(0) == 0);
                if !done {
                    break;
                }

                let Some(pending) = queue.pop_front() else {
                    break;
                };
                for epoch in &pending.epochs {
                    outstanding.remove(epoch);
                    received.remove(epoch);
                }

                acknowledged.push(AcknowledgedCheckpoint {
                    checkpoint: pending.checkpoint,
                    record_count: pending.record_count,
                });
            }
        }

        if !acknowledged.is_empty() {
            debug!(count = acknowledged.len(), "checkpoints acknowledged");
        }

        acknowledged
    }

    /// Returns the number of tracked checkpoints not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.stream_queues.values().map(VecDeque::len).sum::<usize>() + self.global_queue.len()
    }

    fn pending(&self, checkpoint: CheckpointMessage, epochs: Vec<EpochId>) -> PendingCheckpoint {
        let record_count = epochs
            .iter()
            .map(|epoch| self.received.get(epoch).copied().unwrap_or(0))
            .sum();

        PendingCheckpoint {
            checkpoint,
            epochs,
            record_count,
        }
    }

    fn set_mode(&mut self, mode: CheckpointMode) -> SyncResult<()> {
        match self.mode {
            None => {
                self.mode = Some(mode);
                Ok(())
            }
            Some(current) if current == mode => Ok(()),
            Some(current) => bail!(
                ErrorKind::InvalidData,
                "Mixed checkpoint scopes",
                format!("Received a {mode:?} checkpoint in a sync using {current:?} checkpoints")
            ),
        }
    }
}
