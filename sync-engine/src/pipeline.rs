use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use sync_config::shared::SyncConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::destination::StorageOperation;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::spool::RecordSpooler;
use crate::state::checkpoint::{AcknowledgedCheckpoint, CheckpointManager};
use crate::state::lifecycle::StreamLifecycle;
use crate::sync_error;
use crate::types::{
    Catalog, CheckpointMessage, CheckpointScope, StreamId, StreamStatus, StreamSyncSummary,
    SyncMessage,
};
use crate::typing::TyperDeduper;
use crate::workers::{StreamLoader, StreamLoaders, TaskManager};

/// Outcome of one stream of a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub lifecycle: StreamLifecycle,
    /// Present once the stream received its terminal status.
    pub summary: Option<StreamSyncSummary>,
}

/// Per-stream outcome of a sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub streams: BTreeMap<StreamId, StreamReport>,
}

impl SyncReport {
    pub fn stream(&self, stream_id: &StreamId) -> Option<&StreamReport> {
        self.streams.get(stream_id)
    }

    /// Returns the streams that failed along with their error.
    pub fn failed_streams(&self) -> Vec<(&StreamId, &SyncError)> {
        self.streams
            .iter()
            .filter_map(|(stream_id, report)| match &report.lifecycle {
                StreamLifecycle::Failed(err) => Some((stream_id, err)),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if every stream received all of its records and committed its final table.
    ///
    /// A stream closed as [`StreamStatus::Incomplete`] commits what it received but does not
    /// count as a success.
    pub fn is_success(&self) -> bool {
        self.streams.values().all(|report| {
            matches!(report.lifecycle, StreamLifecycle::Complete)
                && report
                    .summary
                    .is_some_and(|summary| summary.terminal_status == StreamStatus::Complete)
        })
    }
}

/// Drives one sync from the incoming messages to committed final tables.
#[derive(Debug)]
pub struct SyncPipeline<S, T> {
    config: Arc<SyncConfig>,
    catalog: Arc<Catalog>,
    storage: Arc<S>,
    typer: Arc<T>,
    checkpoint_tx: mpsc::UnboundedSender<AcknowledgedCheckpoint>,
    shutdown_tx: ShutdownTx,
}

impl<S, T> SyncPipeline<S, T>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    pub fn new(
        config: SyncConfig,
        catalog: Arc<Catalog>,
        storage: S,
        typer: T,
        checkpoint_tx: mpsc::UnboundedSender<AcknowledgedCheckpoint>,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            catalog,
            storage: Arc::new(storage),
            typer: Arc::new(typer),
            checkpoint_tx,
            shutdown_tx,
        }
    }

    /// Returns the sender used to cancel the sync.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub fn typer(&self) -> &Arc<T> {
        &self.typer
    }

    /// Runs the sync over `messages`, consumed in arrival order.
    ///
    /// Tables are prepared concurrently with the consumption of the first messages. Checkpoints
    /// are sent to the checkpoint channel once every record they cover is staged. Streams that
    /// never received a terminal status are closed as incomplete when the input ends.
    ///
    /// Stream-scoped failures are reported in the returned [`SyncReport`]. A sync-scoped failure
    /// or a cancellation aborts the sync and is returned as an error. An invalid configuration is
    /// rejected with [`ErrorKind::ConfigError`] before anything is spooled or prepared.
    pub async fn run<M>(self, messages: M) -> SyncResult<SyncReport>
    where
        M: Stream<Item = SyncMessage> + Unpin,
    {
        if let Err(err) = self.config.validate() {
            error!(error = %err, "invalid sync configuration");
            return Err(err.into());
        }

        info!(
            streams = self.catalog.streams().len(),
            typing = self.typer.supports_typing(),
            "starting sync"
        );

        let shutdown_rx = self.shutdown_tx.subscribe();

        // Loaders become available while messages are already being spooled, tasks wait for them.
        let loaders = StreamLoaders::new(self.catalog.stream_ids());
        let preparation = self.spawn_preparation(loaders.clone());

        let mut manager = TaskManager::new(&self.catalog, loaders, &self.config, shutdown_rx.clone());
        let mut spooler = RecordSpooler::new(&self.config.spool);
        let mut checkpoints = CheckpointManager::new();

        let consumed = self
            .consume(
                messages,
                &mut manager,
                &mut spooler,
                &mut checkpoints,
                shutdown_rx,
            )
            .await;

        if let Err(err) = consumed {
            self.abort(&mut manager, &mut spooler, &mut checkpoints, preparation)
                .await;

            error!(error = %err, "sync aborted");
            return Err(err);
        }

        let result = self
            .commit(&mut manager, &mut checkpoints, preparation)
            .await;

        if let Err(err) = self.typer.cleanup().await {
            warn!(error = %err, "failed to clean up typing pool");
        }

        let report = result?;
        info!(
            success = report.is_success(),
            failed_streams = report.failed_streams().len(),
            "sync completed"
        );

        Ok(report)
    }

    /// Spawns table preparation followed by the creation of every stream loader.
    ///
    /// If preparation fails, every loader still pending fails with the same error.
    fn spawn_preparation(&self, loaders: StreamLoaders<S, T>) -> JoinHandle<SyncResult<()>> {
        let catalog = self.catalog.clone();
        let storage = self.storage.clone();
        let typer = self.typer.clone();
        let stage_write_batch_size = self.config.stage_write_batch_size;

        tokio::spawn(async move {
            // The preparation runs in its own task so that a panic is observed here and turned
            // into an error for the waiting stream tasks.
            let prepare = tokio::spawn(prepare_streams(
                catalog,
                storage,
                typer,
                loaders.clone(),
                stage_write_batch_size,
            ));

            let result = match prepare.await {
                Ok(result) => result,
                Err(err) => Err(sync_error!(
                    ErrorKind::TaskPanic,
                    "Table preparation panicked",
                    err
                )),
            };

            if let Err(err) = &result {
                error!(error = %err, "table preparation failed");
                loaders.fail_pending(err).await;
            }

            result
        })
    }

    async fn consume<M>(
        &self,
        mut messages: M,
        manager: &mut TaskManager<S, T>,
        spooler: &mut RecordSpooler,
        checkpoints: &mut CheckpointManager,
        mut shutdown_rx: ShutdownRx,
    ) -> SyncResult<()>
    where
        M: Stream<Item = SyncMessage> + Unpin,
    {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping sync");

                    return Err(cancelled());
                }

                Some(finished) = manager.join_next(), if manager.has_tasks() => {
                    manager.handle_finished(finished, checkpoints).await?;
                    self.send_acknowledged(checkpoints);
                }

                message = messages.next() => {
                    let Some(message) = message else {
                        break;
                    };

                    self.handle_message(message, manager, spooler, checkpoints).await?;
                }
            }
        }

        debug!("input exhausted, closing remaining streams");

        for stream in self.catalog.streams() {
            if spooler.is_completed(&stream.id) {
                continue;
            }

            info!(stream = %stream.id, "stream received no status, closing it as incomplete");
            let batch = spooler
                .complete_stream(&stream.id, StreamStatus::Incomplete)
                .await?;
            manager.submit(batch).await?;
        }

        while manager.has_tasks() {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping sync");

                    return Err(cancelled());
                }

                finished = manager.join_next() => {
                    let Some(finished) = finished else {
                        break;
                    };

                    manager.handle_finished(finished, checkpoints).await?;
                    self.send_acknowledged(checkpoints);
                }
            }
        }

        Ok(())
    }

    async fn handle_message(
        &self,
        message: SyncMessage,
        manager: &mut TaskManager<S, T>,
        spooler: &mut RecordSpooler,
        checkpoints: &mut CheckpointManager,
    ) -> SyncResult<()> {
        match message {
            SyncMessage::Record(record) => {
                let stream_id = self.catalog.stream(&record.stream)?.id.clone();
                let epoch = checkpoints.register_record(&stream_id);

                if let Some(batch) = spooler.accept(&stream_id, record, epoch).await? {
                    manager.submit(batch).await?;
                }
            }
            SyncMessage::Checkpoint(checkpoint) => {
                self.track_checkpoint(checkpoint, checkpoints)?;
                self.send_acknowledged(checkpoints);
            }
            SyncMessage::StreamStatus { stream, status } => {
                let stream_id = self.catalog.stream(&stream)?.id.clone();
                debug!(stream = %stream_id, ?status, "stream status received");

                let batch = spooler.complete_stream(&stream_id, status).await?;
                manager.submit(batch).await?;
            }
        }

        Ok(())
    }

    fn track_checkpoint(
        &self,
        checkpoint: CheckpointMessage,
        checkpoints: &mut CheckpointManager,
    ) -> SyncResult<()> {
        match &checkpoint.scope {
            CheckpointScope::Stream { stream } => {
                let stream_id = self.catalog.stream(stream)?.id.clone();
                checkpoints.track_stream_checkpoint(&stream_id, checkpoint)
            }
            CheckpointScope::Global => checkpoints.track_global_checkpoint(checkpoint),
        }
    }

    /// Commits the final tables of every closed stream.
    async fn commit(
        &self,
        manager: &mut TaskManager<S, T>,
        checkpoints: &mut CheckpointManager,
        preparation: JoinHandle<SyncResult<()>>,
    ) -> SyncResult<SyncReport> {
        wait_for_preparation(preparation).await?;

        let summaries = manager.summaries();
        info!(streams = summaries.len(), "committing final tables");

        let failures = self.typer.commit_final_tables(&summaries).await?;
        manager.mark_committed(failures);

        self.send_acknowledged(checkpoints);
        if checkpoints.pending_count() > 0 {
            warn!(
                pending = checkpoints.pending_count(),
                "sync completed with unacknowledged checkpoints"
            );
        }

        Ok(manager.report())
    }

    /// Stops every task and releases the resources of an aborted sync.
    async fn abort(
        &self,
        manager: &mut TaskManager<S, T>,
        spooler: &mut RecordSpooler,
        checkpoints: &mut CheckpointManager,
        preparation: JoinHandle<SyncResult<()>>,
    ) {
        // If we fail to send the shutdown signal, it means that nobody is waiting on it anymore,
        // which is fine.
        let _ = self.shutdown_tx.shutdown();

        manager.shutdown().await;
        spooler.discard().await;

        while let Some(finished) = manager.join_next().await {
            if let Err(err) = manager.handle_finished(finished, checkpoints).await {
                debug!(error = %err, "task failed while aborting sync");
            }
        }

        if let Err(err) = wait_for_preparation(preparation).await {
            debug!(error = %err, "table preparation failed while aborting sync");
        }

        if let Err(err) = self.typer.cleanup().await {
            warn!(error = %err, "failed to clean up typing pool");
        }
    }

    fn send_acknowledged(&self, checkpoints: &mut CheckpointManager) {
        for acknowledged in checkpoints.drain_acknowledged() {
            debug!(
                records = acknowledged.record_count,
                "acknowledging checkpoint"
            );

            if self.checkpoint_tx.send(acknowledged).is_err() {
                warn!("checkpoint receiver dropped, checkpoint acknowledgement lost");
            }
        }
    }
}

async fn prepare_streams<S, T>(
    catalog: Arc<Catalog>,
    storage: Arc<S>,
    typer: Arc<T>,
    loaders: StreamLoaders<S, T>,
    stage_write_batch_size: usize,
) -> SyncResult<()>
where
    S: StorageOperation,
    T: TyperDeduper,
{
    typer.prepare_tables().await?;

    let starts = catalog.streams().iter().map(|stream| {
        let storage = storage.clone();
        let typer = typer.clone();

        async move {
            let result =
                StreamLoader::start(stream.clone(), storage, typer, stage_write_batch_size).await;
            (stream.id.clone(), result)
        }
    });

    for (stream_id, result) in join_all(starts).await {
        match result {
            Ok(loader) => loaders.set_ready(&stream_id, loader).await,
            Err(err) => loaders.set_failed(&stream_id, err).await,
        }
    }

    info!("stream loaders started");

    Ok(())
}

async fn wait_for_preparation(preparation: JoinHandle<SyncResult<()>>) -> SyncResult<()> {
    match preparation.await {
        Ok(result) => result,
        Err(err) => Err(sync_error!(
            ErrorKind::TaskPanic,
            "Table preparation panicked",
            err
        )),
    }
}

fn cancelled() -> SyncError {
    sync_error!(ErrorKind::SyncCancelled, "Sync cancelled")
}
