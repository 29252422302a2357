use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use sync_config::shared::SyncConfig;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::destination::StorageOperation;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::pipeline::{StreamReport, SyncReport};
use crate::spool::SpillFile;
use crate::state::checkpoint::CheckpointManager;
use crate::state::lifecycle::StreamLifecycle;
use crate::types::{
    Batch, BatchId, BatchState, Catalog, StreamId, StreamStatus, StreamSyncSummary,
};
use crate::typing::{StreamFailures, TyperDeduper, TypingValve};
use crate::workers::loader::StreamLoader;
use crate::workers::pool::{StreamTaskPool, TaskOutcome};
use crate::workers::process::StreamProcessingTask;
use crate::workers::registry::StreamLoaders;

#[derive(Debug)]
struct StreamTasks {
    queue: VecDeque<Batch>,
    in_flight: bool,
    records_written: u64,
    terminal_status: Option<StreamStatus>,
    lifecycle: StreamLifecycle,
}

impl StreamTasks {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: false,
            records_written: 0,
            terminal_status: None,
            lifecycle: StreamLifecycle::Registered,
        }
    }

    fn transition(&mut self, stream_id: &StreamId, next: StreamLifecycle) {
        let from = self.lifecycle.as_type();
        let to = next.as_type();

        if !self.lifecycle.can_transition_to(to) {
            warn!(stream = %stream_id, %from, %to, "ignoring invalid stream lifecycle transition");
            return;
        }

        info!(stream = %stream_id, %from, %to, "stream lifecycle changed");
        self.lifecycle = next;
    }
}

/// Sequences the tasks of every stream of a sync.
///
/// Batches of a stream are processed one at a time, in the order they were submitted. After each
/// staged batch the manager decides whether to process the next batch, run a typing pass or, once
/// the batch ending the stream is staged, close the stream. A stream-scoped failure marks only the
/// affected stream failed and drops its queued batches.
pub struct TaskManager<S, T> {
    loaders: StreamLoaders<S, T>,
    pool: StreamTaskPool,
    valve: TypingValve,
    streams: HashMap<StreamId, StreamTasks>,
    shutdown_rx: ShutdownRx,
    accepting: bool,
}

impl<S, T> TaskManager<S, T>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    pub fn new(
        catalog: &Catalog,
        loaders: StreamLoaders<S, T>,
        config: &SyncConfig,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let mut valve = TypingValve::new(config.typing.incremental_interval());
        let mut streams = HashMap::new();
        for stream_id in catalog.stream_ids() {
            valve.add_stream(stream_id);
            streams.insert(stream_id.clone(), StreamTasks::new());
        }

        Self {
            loaders,
            pool: StreamTaskPool::new(config.max_processing_workers),
            valve,
            streams,
            shutdown_rx,
            accepting: true,
        }
    }

    /// Queues a spooled batch behind the other batches of its stream.
    ///
    /// Batches of failed streams are dropped and their spill files removed.
    pub async fn submit(&mut self, batch: Batch) -> SyncResult<()> {
        let stream_id = batch.stream_id().clone();

        let Some(tasks) = self.streams.get_mut(&stream_id) else {
            discard_batch(batch).await;
            bail!(
                ErrorKind::UnknownStream,
                "Batch for unknown stream",
                format!("Received a batch for stream {stream_id} which is not in the catalog")
            );
        };

        if !self.accepting || tasks.lifecycle.is_terminal() {
            debug!(stream = %stream_id, batch_id = batch.id(), "dropping batch of stopped stream");
            discard_batch(batch).await;
            return Ok(());
        }

        tasks.queue.push_back(batch);
        self.schedule(&stream_id);

        Ok(())
    }

    pub fn has_tasks(&self) -> bool {
        self.pool.has_tasks()
    }

    /// Waits for the next task to finish.
    ///
    /// Returns `None` when no task is running. Cancelling the returned future loses no task, the
    /// finished task must be passed to [`TaskManager::handle_finished`].
    pub async fn join_next(&mut self) -> Option<SyncResult<(StreamId, TaskOutcome)>> {
        self.pool.join_next().await
    }

    /// Records the outcome of a finished task and schedules what follows it.
    ///
    /// Errors returned are sync-scoped, stream-scoped failures are recorded in the stream's
    /// lifecycle.
    pub async fn handle_finished(
        &mut self,
        finished: SyncResult<(StreamId, TaskOutcome)>,
        checkpoints: &mut CheckpointManager,
    ) -> SyncResult<()> {
        let (stream_id, outcome) = finished?;

        self.handle_outcome(stream_id, outcome, checkpoints).await
    }

    /// Stops scheduling tasks and drops every queued batch.
    ///
    /// Running tasks finish, [`TaskManager::join_next`] must still be called to collect them.
    pub async fn shutdown(&mut self) {
        self.accepting = false;
        self.pool.shutdown();

        let queued: Vec<Batch> = self
            .streams
            .values_mut()
            .flat_map(|tasks| tasks.queue.drain(..))
            .collect();
        for batch in queued {
            discard_batch(batch).await;
        }
    }

    /// Returns the summaries of the streams that closed and wait for their final table commit.
    pub fn summaries(&self) -> HashMap<StreamId, StreamSyncSummary> {
        self.streams
            .iter()
            .filter(|(_, tasks)| matches!(tasks.lifecycle, StreamLifecycle::Committing))
            .filter_map(|(stream_id, tasks)| {
                tasks.terminal_status.map(|terminal_status| {
                    (
                        stream_id.clone(),
                        StreamSyncSummary {
                            records_written: tasks.records_written,
                            terminal_status,
                        },
                    )
                })
            })
            .collect()
    }

    /// Completes every committing stream, failing those listed in `failures`.
    pub fn mark_committed(&mut self, mut failures: StreamFailures) {
        for (stream_id, tasks) in &mut self.streams {
            if !matches!(tasks.lifecycle, StreamLifecycle::Committing) {
                continue;
            }

            match failures.remove(stream_id) {
                Some(err) => {
                    error!(stream = %stream_id, error = %err, "final table commit failed");
                    tasks.transition(stream_id, StreamLifecycle::Failed(err));
                }
                None => tasks.transition(stream_id, StreamLifecycle::Complete),
            }
        }
    }

    /// Builds the per-stream report of the sync.
    pub fn report(&self) -> SyncReport {
        let streams = self
            .streams
            .iter()
            .map(|(stream_id, tasks)| {
                let report = StreamReport {
                    lifecycle: tasks.lifecycle.clone(),
                    summary: tasks.terminal_status.map(|terminal_status| StreamSyncSummary {
                        records_written: tasks.records_written,
                        terminal_status,
                    }),
                };
                (stream_id.clone(), report)
            })
            .collect::<BTreeMap<_, _>>();

        SyncReport { streams }
    }

    async fn handle_outcome(
        &mut self,
        stream_id: StreamId,
        outcome: TaskOutcome,
        checkpoints: &mut CheckpointManager,
    ) -> SyncResult<()> {
        match outcome {
            TaskOutcome::Processed(Ok(mut batch)) => {
                checkpoints.complete_records(batch.epochs())?;

                if let Some(tasks) = self.streams.get_mut(&stream_id) {
                    tasks.records_written += batch.record_count();
                    if matches!(tasks.lifecycle, StreamLifecycle::Registered) {
                        tasks.transition(&stream_id, StreamLifecycle::Loading);
                    }
                }

                if batch.state() == BatchState::Incomplete {
                    if self.accepting && self.valve.ready(&stream_id) {
                        self.spawn_typing(stream_id, batch);
                        return Ok(());
                    }

                    // Typed when the stream closes.
                    batch.transition(BatchState::Processing)?;
                    batch.transition(BatchState::Complete)?;
                }

                self.after_batch(stream_id, batch);
                Ok(())
            }
            TaskOutcome::Typed(Ok(batch)) => {
                self.valve.mark_typed(&stream_id);
                self.after_batch(stream_id, batch);
                Ok(())
            }
            TaskOutcome::Closed(Ok(())) => {
                if let Some(tasks) = self.streams.get_mut(&stream_id) {
                    tasks.in_flight = false;
                    tasks.transition(&stream_id, StreamLifecycle::Committing);
                }
                Ok(())
            }
            TaskOutcome::Processed(Err(err))
            | TaskOutcome::Typed(Err(err))
            | TaskOutcome::Closed(Err(err)) => self.fail_stream(&stream_id, err).await,
        }
    }

    /// Continues a stream after one of its batches completed.
    fn after_batch(&mut self, stream_id: StreamId, batch: Batch) {
        let Some(tasks) = self.streams.get_mut(&stream_id) else {
            return;
        };

        let Some(terminal_status) = batch.end_of_stream() else {
            tasks.in_flight = false;
            self.schedule(&stream_id);
            return;
        };

        tasks.terminal_status = Some(terminal_status);
        if !self.accepting {
            tasks.in_flight = false;
            return;
        }

        let summary = StreamSyncSummary {
            records_written: tasks.records_written,
            terminal_status,
        };
        info!(
            stream = %stream_id,
            records = summary.records_written,
            status = ?terminal_status,
            "closing stream"
        );

        let loaders = self.loaders.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let task_stream_id = stream_id.clone();
        self.pool.spawn(
            stream_id,
            async move {
                let loader = wait_for_loader(&loaders, &task_stream_id, &mut shutdown_rx).await?;
                loader.close(summary).await
            },
            TaskOutcome::Closed,
        );
    }

    fn spawn_typing(&mut self, stream_id: StreamId, mut batch: Batch) {
        debug!(stream = %stream_id, batch_id = batch.id(), "running incremental typing pass");

        let loaders = self.loaders.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let task_stream_id = stream_id.clone();
        self.pool.spawn(
            stream_id,
            async move {
                batch.transition(BatchState::Processing)?;
                let loader = wait_for_loader(&loaders, &task_stream_id, &mut shutdown_rx).await?;
                loader.type_incrementally().await?;
                batch.transition(BatchState::Complete)?;
                Ok(batch)
            },
            TaskOutcome::Typed,
        );
    }

    /// Starts processing the next queued batch of a stream, unless one is already in flight.
    fn schedule(&mut self, stream_id: &StreamId) {
        if !self.accepting {
            return;
        }

        let Some(tasks) = self.streams.get_mut(stream_id) else {
            return;
        };
        if tasks.in_flight || tasks.lifecycle.is_terminal() {
            return;
        }
        let Some(batch) = tasks.queue.pop_front() else {
            return;
        };
        tasks.in_flight = true;

        // The batch is lost with the future if the pool rejects the task.
        let rejected_stream_id = stream_id.clone();
        let batch_id = batch.id();
        let spill = batch.spill().map(|spill| SpillFile::from_path(spill.path()));

        let loaders = self.loaders.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let task_stream_id = stream_id.clone();
        self.pool.spawn_or_else(
            stream_id.clone(),
            async move { process_batch(loaders, task_stream_id, batch, shutdown_rx).await },
            async move {
                if let Some(spill) = spill {
                    discard_spill(&rejected_stream_id, batch_id, spill).await;
                }
            },
            TaskOutcome::Processed,
        );
    }

    async fn fail_stream(&mut self, stream_id: &StreamId, err: SyncError) -> SyncResult<()> {
        let queued = match self.streams.get_mut(stream_id) {
            Some(tasks) => {
                error!(stream = %stream_id, error = %err, "stream failed");

                tasks.in_flight = false;
                tasks.transition(stream_id, StreamLifecycle::Failed(err.clone()));
                tasks.queue.drain(..).collect()
            }
            None => Vec::new(),
        };

        for batch in queued {
            discard_batch(batch).await;
        }

        if err.kind().is_sync_scoped() {
            return Err(err);
        }

        Ok(())
    }
}

async fn wait_for_loader<S, T>(
    loaders: &StreamLoaders<S, T>,
    stream_id: &StreamId,
    shutdown_rx: &mut ShutdownRx,
) -> SyncResult<Arc<StreamLoader<S, T>>> {
    match loaders.wait_for(stream_id, shutdown_rx).await {
        ShutdownResult::Ok(loader) => loader,
        ShutdownResult::Shutdown(()) => bail!(
            ErrorKind::SyncCancelled,
            "Sync cancelled while waiting for stream loader",
            format!("Stream {stream_id} was cancelled before its loader was ready")
        ),
    }
}

async fn process_batch<S, T>(
    loaders: StreamLoaders<S, T>,
    stream_id: StreamId,
    batch: Batch,
    mut shutdown_rx: ShutdownRx,
) -> SyncResult<Batch>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    let loader = match wait_for_loader(&loaders, &stream_id, &mut shutdown_rx).await {
        Ok(loader) => loader,
        Err(err) => {
            discard_batch(batch).await;
            return Err(err);
        }
    };

    StreamProcessingTask::new(loader, batch, shutdown_rx)
        .run()
        .await
}

async fn discard_batch(mut batch: Batch) {
    if let Some(spill) = batch.take_spill() {
        discard_spill(batch.stream_id(), batch.id(), spill).await;
    }
}

async fn discard_spill(stream_id: &StreamId, batch_id: BatchId, spill: SpillFile) {
    if let Err(err) = spill.delete().await {
        warn!(
            stream = %stream_id,
            batch_id,
            error = %err,
            "failed to delete spill file of dropped batch"
        );
    }
}
