use std::sync::Arc;

use tracing::{debug, warn};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::destination::StorageOperation;
use crate::error::{ErrorKind, SyncResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{PROCESS_SPILL__AFTER_STAGE, sync_fail_point};
use crate::spool::SpillFile;
use crate::types::{Batch, BatchState, StreamStatus};
use crate::typing::TyperDeduper;
use crate::workers::loader::StreamLoader;

/// What staging the records of one spill file produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedSpill {
    /// `Incomplete` when the staged records still wait for a typing pass.
    pub state: BatchState,
    pub record_count: u64,
    pub end_of_stream: Option<StreamStatus>,
}

/// Stages the records of a spill file through a stream's loader.
///
/// Records are read lazily in spooling order, stopping at the stream status sentinel. The spill
/// file is left untouched, so a failed attempt can be replayed from it.
pub async fn process_spill<S, T>(
    loader: &StreamLoader<S, T>,
    spill: &SpillFile,
    shutdown_rx: &mut ShutdownRx,
) -> SyncResult<ProcessedSpill>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    let mut records = spill.open().await?;
    let record_count = loader.write_records(&mut records, shutdown_rx).await?;

    #[cfg(feature = "failpoints")]
    sync_fail_point(PROCESS_SPILL__AFTER_STAGE)?;

    let state = if record_count > 0 && loader.types_incrementally() {
        BatchState::Incomplete
    } else {
        BatchState::Complete
    };

    Ok(ProcessedSpill {
        state,
        record_count,
        end_of_stream: records.end_of_stream(),
    })
}

/// Task staging one spooled batch of a stream.
pub struct StreamProcessingTask<S, T> {
    loader: Arc<StreamLoader<S, T>>,
    batch: Batch,
    shutdown_rx: ShutdownRx,
}

impl<S, T> StreamProcessingTask<S, T>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    pub fn new(loader: Arc<StreamLoader<S, T>>, batch: Batch, shutdown_rx: ShutdownRx) -> Self {
        Self {
            loader,
            batch,
            shutdown_rx,
        }
    }

    /// Stages the batch and returns its result batch.
    ///
    /// The spill file is deleted whether staging succeeded or not.
    pub async fn run(self) -> SyncResult<Batch> {
        let Self {
            loader,
            mut batch,
            mut shutdown_rx,
        } = self;

        batch.transition(BatchState::Processing)?;
        let Some(spill) = batch.take_spill() else {
            bail!(
                ErrorKind::InvalidState,
                "Batch has no spill file",
                format!(
                    "Batch {} of stream {} was already processed",
                    batch.id(),
                    batch.stream_id()
                )
            );
        };

        let result = process_spill(&loader, &spill, &mut shutdown_rx).await;

        if let Err(err) = spill.delete().await {
            warn!(
                stream = %batch.stream_id(),
                batch_id = batch.id(),
                error = %err,
                "failed to delete spill file"
            );
        }

        let processed = result?;
        debug!(
            stream = %batch.stream_id(),
            batch_id = batch.id(),
            records = processed.record_count,
            state = %processed.state,
            "batch staged"
        );

        batch.into_result(
            processed.state,
            processed.record_count,
            processed.end_of_stream,
        )
    }
}
