use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sync_config::shared::TypingConfig;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::destination::sql::{Sql, SqlGenerator};
use crate::destination::{DestinationHandler, NO_SUFFIX, StorageOperation, TMP_TABLE_SUFFIX};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::migration::Migrator;
use crate::state::destination::DestinationState;
use crate::state::initial::DestinationInitialStatus;
use crate::types::{Catalog, StreamConfig, StreamId, StreamStatus, StreamSyncSummary};
use crate::typing::base::{PreparedStream, StreamFailures, TyperDeduper, TypingPhase};
use crate::typing::lock::RawTableLock;
use crate::{bail, sync_error};

#[derive(Debug)]
struct StreamTyping<St> {
    status: Option<DestinationInitialStatus<St>>,
    phase: TypingPhase,
    soft_reset_pending: bool,
    final_suffix: String,
    failure: Option<SyncError>,
}

impl<St> StreamTyping<St> {
    fn new() -> Self {
        Self {
            status: None,
            phase: TypingPhase::Unprepared,
            soft_reset_pending: false,
            final_suffix: NO_SUFFIX.to_string(),
            failure: None,
        }
    }

    fn advance(&mut self, stream_id: &StreamId, phase: TypingPhase) {
        if phase > self.phase {
            debug!(stream = %stream_id, from = %self.phase, to = %phase, "typing phase changed");
            self.phase = phase;
        }
    }
}

/// Decision taken for a stream's final table during preparation.
struct FinalTablePlan<St> {
    final_suffix: String,
    soft_reset_pending: bool,
    cleared_state: Option<St>,
}

struct Inner<H, S>
where
    H: DestinationHandler,
{
    handler: H,
    storage: S,
    generator: Arc<dyn SqlGenerator>,
    migrator: Migrator<H>,
    catalog: Arc<Catalog>,
    streams: Mutex<HashMap<StreamId, StreamTyping<H::State>>>,
    locks: HashMap<StreamId, RawTableLock>,
    pool: Arc<Semaphore>,
    setup_failed: AtomicBool,
}

/// [`TyperDeduper`] writing typed, deduplicated final tables through a [`StorageOperation`].
///
/// Work across streams runs on a pool of `typing.max_workers` permits. Within a stream, typing
/// is serialized by the stream's [`RawTableLock`], held exclusively for each pass. A soft reset
/// requested by migrations or by a schema mismatch is executed once, before the first typing pass
/// or at commit time, and the cleared flag is persisted right after it.
pub struct DefaultTyperDeduper<H, S>
where
    H: DestinationHandler,
{
    inner: Arc<Inner<H, S>>,
}

impl<H, S> Clone for DefaultTyperDeduper<H, S>
where
    H: DestinationHandler,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H, S> DefaultTyperDeduper<H, S>
where
    H: DestinationHandler,
    S: StorageOperation,
{
    pub fn new(
        handler: H,
        storage: S,
        generator: Arc<dyn SqlGenerator>,
        migrator: Migrator<H>,
        catalog: Arc<Catalog>,
        config: &TypingConfig,
    ) -> Self {
        let streams = catalog
            .stream_ids()
            .map(|stream_id| (stream_id.clone(), StreamTyping::new()))
            .collect();
        let locks = catalog
            .stream_ids()
            .map(|stream_id| (stream_id.clone(), RawTableLock::real()))
            .collect();

        let inner = Inner {
            handler,
            storage,
            generator,
            migrator,
            catalog,
            streams: Mutex::new(streams),
            locks,
            pool: Arc::new(Semaphore::new(config.max_workers as usize)),
            setup_failed: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the typing phase a stream reached.
    pub async fn phase(&self, stream_id: &StreamId) -> Option<TypingPhase> {
        let streams = self.inner.streams.lock().await;
        streams.get(stream_id).map(|stream| stream.phase)
    }

    /// Returns `true` if a soft reset is still pending for a stream.
    pub async fn is_soft_reset_pending(&self, stream_id: &StreamId) -> bool {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream_id)
            .is_some_and(|stream| stream.soft_reset_pending)
    }

    fn fail_setup(&self, err: SyncError) -> SyncError {
        self.inner.setup_failed.store(true, Ordering::SeqCst);
        err
    }
}

impl<H, S> Inner<H, S>
where
    H: DestinationHandler,
    S: StorageOperation,
{
    /// Runs `work` for every stream on the typing pool and collects the per-stream results.
    ///
    /// A panicking task fails the whole call.
    async fn on_pool<T, R, F, Fut>(
        self: &Arc<Self>,
        items: Vec<(StreamId, T)>,
        work: F,
    ) -> SyncResult<Vec<(StreamId, SyncResult<R>)>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Arc<Self>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<R>> + Send + 'static,
    {
        let work = Arc::new(work);
        let mut join_set = JoinSet::new();

        for (stream_id, item) in items {
            let inner = Arc::clone(self);
            let work = Arc::clone(&work);
            join_set.spawn(async move {
                let result = match inner.pool.clone().acquire_owned().await {
                    Ok(_permit) => work(Arc::clone(&inner), item).await,
                    Err(_) => Err(pool_shutdown_error()),
                };
                (stream_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => {
                    return Err(sync_error!(
                        ErrorKind::TaskPanic,
                        "Typing task panicked",
                        err
                    ));
                }
            }
        }

        Ok(results)
    }

    fn lock_for(&self, stream_id: &StreamId) -> SyncResult<RawTableLock> {
        match self.locks.get(stream_id) {
            Some(lock) => Ok(lock.clone()),
            None => bail!(
                ErrorKind::UnknownStream,
                "Stream not in catalog",
                format!("No raw table lock exists for stream {stream_id}")
            ),
        }
    }

    async fn stream_failure(&self, stream_id: &StreamId) -> Option<SyncError> {
        let streams = self.streams.lock().await;
        streams
            .get(stream_id)
            .and_then(|stream| stream.failure.clone())
    }

    async fn record_failure(&self, stream_id: &StreamId, err: &SyncError) {
        error!(stream = %stream_id, error = %err, "typing failed for stream");

        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(stream_id) {
            stream.failure.get_or_insert_with(|| err.clone());
        }
    }

    async fn advance(&self, stream_id: &StreamId, phase: TypingPhase) {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(stream_id) {
            stream.advance(stream_id, phase);
        }
    }

    async fn prepare_final_table(
        &self,
        status: &DestinationInitialStatus<H::State>,
    ) -> SyncResult<FinalTablePlan<H::State>> {
        let stream = &status.stream_config;
        let truncate = stream.is_truncate_sync();

        let final_suffix = if !status.is_final_table_present {
            self.storage
                .create_final_table(stream, NO_SUFFIX, false)
                .await?;
            NO_SUFFIX
        } else if truncate && !(status.is_final_table_empty && !status.is_schema_mismatch) {
            // The existing table keeps serving reads until the temp table replaces it at commit.
            self.storage
                .create_final_table(stream, TMP_TABLE_SUFFIX, true)
                .await?;
            TMP_TABLE_SUFFIX
        } else {
            NO_SUFFIX
        };

        let needs_soft_reset = status.destination_state.needs_soft_reset();
        let soft_reset_pending = !truncate && (status.is_schema_mismatch || needs_soft_reset);
        let cleared_state =
            (truncate && needs_soft_reset).then(|| status.destination_state.with_soft_reset(false));

        Ok(FinalTablePlan {
            final_suffix: final_suffix.to_string(),
            soft_reset_pending,
            cleared_state,
        })
    }

    /// Executes the stream's pending soft reset, if any, and persists the cleared flag.
    ///
    /// Callers must hold the stream's raw table lock exclusively.
    async fn soft_reset_if_pending(&self, stream: &StreamConfig) -> SyncResult<()> {
        let state = {
            let streams = self.streams.lock().await;
            streams
                .get(&stream.id)
                .filter(|typing| typing.soft_reset_pending)
                .and_then(|typing| typing.status.as_ref())
                .map(|status| status.destination_state.clone())
        };

        let Some(state) = state else {
            return Ok(());
        };

        info!(stream = %stream.id, "executing soft reset");
        self.storage.soft_reset_final_table(stream).await?;

        let state = state.with_soft_reset(false);
        self.handler
            .commit_destination_states(HashMap::from([(stream.id.clone(), state.clone())]))
            .await?;

        let mut streams = self.streams.lock().await;
        if let Some(typing) = streams.get_mut(&stream.id) {
            typing.soft_reset_pending = false;
            typing.status = typing
                .status
                .take()
                .map(|status| status.with_destination_state(state));
            typing.advance(&stream.id, TypingPhase::SoftReset);
        }

        Ok(())
    }

    async fn type_and_dedupe_locked(
        &self,
        stream: &StreamConfig,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> SyncResult<()> {
        let lock = self.lock_for(&stream.id)?;
        let _guard = lock.lock_exclusive().await;

        self.soft_reset_if_pending(stream).await?;

        info!(
            stream = %stream.id,
            table = stream.id.final_table(final_suffix),
            "typing and deduping stream"
        );
        self.storage
            .type_and_dedupe(stream, max_processed_timestamp, final_suffix)
            .await?;

        self.advance(&stream.id, TypingPhase::TypedAndDeduped).await;

        Ok(())
    }

    async fn commit_final_table(
        &self,
        stream: &StreamConfig,
        summary: StreamSyncSummary,
    ) -> SyncResult<()> {
        let lock = self.lock_for(&stream.id)?;
        let _guard = lock.lock_exclusive().await;

        self.soft_reset_if_pending(stream).await?;

        if summary.terminal_status != StreamStatus::Complete {
            info!(stream = %stream.id, "stream did not complete, leaving final table as is");
            return Ok(());
        }

        let final_suffix = {
            let streams = self.streams.lock().await;
            streams
                .get(&stream.id)
                .map(|typing| typing.final_suffix.clone())
                .unwrap_or_default()
        };

        if stream.is_truncate_sync() && final_suffix == TMP_TABLE_SUFFIX {
            info!(stream = %stream.id, "overwriting final table with temp final table");
            self.storage
                .overwrite_final_table(&stream.id, TMP_TABLE_SUFFIX)
                .await?;
        }

        self.advance(&stream.id, TypingPhase::FinalCommitted).await;

        Ok(())
    }
}

impl<H, S> TyperDeduper for DefaultTyperDeduper<H, S>
where
    H: DestinationHandler,
    S: StorageOperation,
{
    async fn prepare_schemas_and_run_migrations(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let streams = inner.catalog.streams();

        let statuses = inner
            .handler
            .gather_initial_state(streams)
            .await
            .map_err(|err| self.fail_setup(err))?;

        let namespaces: BTreeSet<&str> = streams
            .iter()
            .flat_map(|stream| {
                [
                    stream.id.raw_namespace.as_str(),
                    stream.id.final_namespace.as_str(),
                ]
            })
            .collect();
        let sql = Sql::concat(
            namespaces
                .iter()
                .map(|namespace| inner.generator.create_schema(namespace)),
        );

        info!(namespaces = ?namespaces, "creating namespaces");
        if let Err(err) = inner.handler.execute(sql).await {
            return Err(self.fail_setup(sync_error!(
                ErrorKind::DestinationNamespaceCreationFailed,
                "Failed to create namespaces",
                err.to_string(),
                source: err
            )));
        }

        info!(
            streams = statuses.len(),
            migrations = inner.migrator.len(),
            "running migrations"
        );
        let items = statuses
            .into_iter()
            .map(|status| (status.stream_config.id.clone(), status))
            .collect();
        let results = inner
            .on_pool(items, |inner, status| async move {
                inner.migrator.run(&inner.handler, status).await
            })
            .await
            .map_err(|err| self.fail_setup(err))?;

        let mut states = HashMap::new();
        {
            let mut typing = inner.streams.lock().await;
            for (stream_id, result) in results {
                let Some(stream) = typing.get_mut(&stream_id) else {
                    continue;
                };

                match result {
                    Ok(status) => {
                        states.insert(stream_id.clone(), status.destination_state.clone());
                        stream.status = Some(status);
                        stream.advance(&stream_id, TypingPhase::SchemaPrepared);
                    }
                    Err(err) => {
                        error!(stream = %stream_id, error = %err, "migrations failed for stream");
                        stream.failure = Some(err);
                    }
                }
            }
        }

        inner
            .handler
            .commit_destination_states(states)
            .await
            .map_err(|err| self.fail_setup(err))?;

        Ok(())
    }

    async fn prepare_final_tables(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.setup_failed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let items: Vec<_> = {
            let streams = inner.streams.lock().await;
            streams
                .iter()
                .filter(|(_, stream)| stream.failure.is_none())
                .filter_map(|(stream_id, stream)| {
                    stream
                        .status
                        .clone()
                        .map(|status| (stream_id.clone(), status))
                })
                .collect()
        };

        let results = inner
            .on_pool(items, |inner, status| async move {
                inner.prepare_final_table(&status).await
            })
            .await
            .map_err(|err| self.fail_setup(err))?;

        let mut cleared_states = HashMap::new();
        {
            let mut streams = inner.streams.lock().await;
            for (stream_id, result) in results {
                let Some(stream) = streams.get_mut(&stream_id) else {
                    continue;
                };

                match result {
                    Ok(plan) => {
                        if plan.soft_reset_pending {
                            info!(stream = %stream_id, "soft reset pending for stream");
                        }
                        if let Some(state) = plan.cleared_state {
                            stream.status = stream
                                .status
                                .take()
                                .map(|status| status.with_destination_state(state.clone()));
                            cleared_states.insert(stream_id.clone(), state);
                        }

                        debug!(
                            stream = %stream_id,
                            final_suffix = plan.final_suffix,
                            "final table prepared"
                        );
                        stream.final_suffix = plan.final_suffix;
                        stream.soft_reset_pending = plan.soft_reset_pending;
                    }
                    Err(err) => {
                        error!(stream = %stream_id, error = %err, "final table preparation failed for stream");
                        stream.failure = Some(err);
                    }
                }
            }
        }

        if !cleared_states.is_empty() {
            inner
                .handler
                .commit_destination_states(cleared_states)
                .await
                .map_err(|err| self.fail_setup(err))?;
        }

        Ok(())
    }

    async fn prepared_stream(&self, stream_id: &StreamId) -> SyncResult<PreparedStream> {
        if self.inner.setup_failed.load(Ordering::SeqCst) {
            bail!(
                ErrorKind::StreamSetupFailed,
                "Table preparation failed",
                format!("Stream {stream_id} cannot be loaded because table preparation failed")
            );
        }

        let streams = self.inner.streams.lock().await;
        let Some(stream) = streams.get(stream_id) else {
            bail!(
                ErrorKind::UnknownStream,
                "Stream not in catalog",
                format!("Stream {stream_id} is not in the catalog")
            );
        };

        if let Some(err) = &stream.failure {
            return Err(err.clone());
        }

        let Some(status) = &stream.status else {
            bail!(
                ErrorKind::InvalidState,
                "Stream not prepared",
                format!("Tables of stream {stream_id} were not prepared")
            );
        };

        Ok(PreparedStream {
            raw_table_status: status.initial_raw_table_status,
            temp_raw_table_status: status.initial_temp_raw_table_status,
            final_table_suffix: stream.final_suffix.clone(),
        })
    }

    async fn type_and_dedupe(
        &self,
        stream_id: &StreamId,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.setup_failed.load(Ordering::SeqCst) {
            info!(stream = %stream_id, "skipping typing and deduping, table preparation failed");
            return Ok(());
        }

        let Some(stream) = inner.catalog.stream_by_id(stream_id) else {
            bail!(
                ErrorKind::UnknownStream,
                "Stream not in catalog",
                format!("Cannot type and dedupe stream {stream_id} which is not in the catalog")
            );
        };

        if let Some(err) = inner.stream_failure(stream_id).await {
            return Err(err);
        }

        let _permit = inner
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| pool_shutdown_error())?;

        let result = inner
            .type_and_dedupe_locked(stream, max_processed_timestamp, final_suffix)
            .await;
        if let Err(err) = &result {
            inner.record_failure(stream_id, err).await;
        }

        result
    }

    async fn commit_final_tables(
        &self,
        summaries: &HashMap<StreamId, StreamSyncSummary>,
    ) -> SyncResult<StreamFailures> {
        let inner = &self.inner;
        if inner.setup_failed.load(Ordering::SeqCst) {
            info!("skipping final table commit, table preparation failed");
            return Ok(StreamFailures::new());
        }

        let mut items = Vec::new();
        for stream in inner.catalog.streams() {
            let Some(summary) = summaries.get(&stream.id) else {
                continue;
            };
            if inner.stream_failure(&stream.id).await.is_some() {
                continue;
            }
            items.push((stream.id.clone(), (stream.clone(), *summary)));
        }

        info!(streams = items.len(), "committing final tables");
        let results = inner
            .on_pool(items, |inner, (stream, summary)| async move {
                inner.commit_final_table(&stream, summary).await
            })
            .await?;

        let mut failures = StreamFailures::new();
        for (stream_id, result) in results {
            if let Err(err) = result {
                inner.record_failure(&stream_id, &err).await;
                failures.insert(stream_id, err);
            }
        }

        Ok(failures)
    }

    async fn cleanup(&self) -> SyncResult<()> {
        if !self.inner.pool.is_closed() {
            self.inner.pool.close();
            info!("typing worker pool shut down");
        }

        Ok(())
    }

    fn raw_table_insert_lock(&self, stream_id: &StreamId) -> SyncResult<RawTableLock> {
        self.inner.lock_for(stream_id)
    }
}

fn pool_shutdown_error() -> SyncError {
    sync_error!(
        ErrorKind::WorkerPoolShutdown,
        "Typing worker pool is shut down"
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sync_telemetry::init_test_tracing;

    use super::*;
    use crate::destination::memory::{MemoryDestination, MemorySqlGenerator};
    use crate::state::destination::MinimumDestinationState;
    use crate::test_utils::catalog::{
        EVENTS, KV, build_catalog, events_stream, kv_stream, refresh, stream_id,
    };
    use crate::test_utils::storage::{StorageCall, TestStorageWrapper};
    use crate::types::{ConfiguredStream, RecordMessage, SyncMode};

    type Destination = TestStorageWrapper<MemoryDestination<MinimumDestinationState>>;
    type Typer = DefaultTyperDeduper<Destination, Destination>;

    fn typer(destination: &Destination, streams: Vec<ConfiguredStream>, max_workers: u16) -> Typer {
        DefaultTyperDeduper::new(
            destination.clone(),
            destination.clone(),
            Arc::new(MemorySqlGenerator),
            Migrator::empty(),
            Arc::new(build_catalog(streams)),
            &TypingConfig {
                max_workers,
                incremental_interval_ms: None,
            },
        )
    }

    fn summary(terminal_status: StreamStatus) -> StreamSyncSummary {
        StreamSyncSummary {
            records_written: 1,
            terminal_status,
        }
    }

    async fn stage_kv(destination: &Destination, stream: &StreamConfig, k: &str, v: i64) {
        destination
            .prepare_stage(&stream.id, NO_SUFFIX, false)
            .await
            .unwrap();
        destination
            .write_to_stage(
                stream,
                NO_SUFFIX,
                vec![RecordMessage::new(
                    stream.id.descriptor(),
                    json!({ "K": k, "V": v }),
                    Utc::now(),
                )],
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prepares_namespaces_in_one_batch_and_creates_final_tables() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let typer = typer(
            &destination,
            vec![events_stream(SyncMode::Append), kv_stream(SyncMode::AppendDedup)],
            2,
        );

        typer.prepare_tables().await.unwrap();

        let memory = destination.wrapped();
        assert_eq!(memory.executed_statements().await.len(), 2);
        assert_eq!(
            memory.namespaces().await,
            BTreeSet::from(["public".to_string(), "sync_internal".to_string()])
        );

        for name in [EVENTS, KV] {
            let stream_id = stream_id(name);
            assert!(memory.final_table_exists(&stream_id, NO_SUFFIX).await);
            assert_eq!(typer.phase(&stream_id).await, Some(TypingPhase::SchemaPrepared));
            assert_eq!(
                typer.prepared_stream(&stream_id).await.unwrap().final_table_suffix,
                NO_SUFFIX
            );
            assert_eq!(
                memory.destination_state(&stream_id).await,
                Some(MinimumDestinationState::new(false))
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn soft_reset_runs_once_before_first_typing() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let kv_id = stream_id(KV);
        destination
            .wrapped()
            .set_destination_state(&kv_id, MinimumDestinationState::new(true))
            .await;

        let typer = typer(&destination, vec![kv_stream(SyncMode::AppendDedup)], 2);
        typer.prepare_tables().await.unwrap();
        assert!(typer.is_soft_reset_pending(&kv_id).await);

        let catalog = build_catalog(vec![kv_stream(SyncMode::AppendDedup)]);
        let stream = catalog.stream_by_id(&kv_id).unwrap();
        stage_kv(&destination, stream, "a", 1).await;

        typer.type_and_dedupe(&kv_id, None, NO_SUFFIX).await.unwrap();
        typer.type_and_dedupe(&kv_id, None, NO_SUFFIX).await.unwrap();

        let soft_resets = destination
            .count_calls(&kv_id, |call| *call == StorageCall::SoftResetFinalTable)
            .await;
        assert_eq!(soft_resets, 1);
        assert!(!typer.is_soft_reset_pending(&kv_id).await);
        assert_eq!(
            destination.wrapped().destination_state(&kv_id).await,
            Some(MinimumDestinationState::new(false))
        );
        assert_eq!(typer.phase(&kv_id).await, Some(TypingPhase::TypedAndDeduped));
        assert_eq!(destination.wrapped().final_rows(&kv_id).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_of_populated_table_is_typed_into_temp_table() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let kv_id = stream_id(KV);

        // A previous sync left one typed row behind.
        let previous = build_catalog(vec![kv_stream(SyncMode::Append)]);
        let stream = previous.stream_by_id(&kv_id).unwrap();
        destination
            .create_final_table(stream, NO_SUFFIX, false)
            .await
            .unwrap();
        stage_kv(&destination, stream, "old", 1).await;
        destination
            .type_and_dedupe(stream, None, NO_SUFFIX)
            .await
            .unwrap();

        let typer = typer(&destination, vec![refresh(kv_stream(SyncMode::Append), 2)], 2);
        typer.prepare_tables().await.unwrap();

        let prepared = typer.prepared_stream(&kv_id).await.unwrap();
        assert_eq!(prepared.final_table_suffix, TMP_TABLE_SUFFIX);
        assert!(
            destination
                .wrapped()
                .final_table_exists(&kv_id, TMP_TABLE_SUFFIX)
                .await
        );

        let failures = typer
            .commit_final_tables(&HashMap::from([(
                kv_id.clone(),
                summary(StreamStatus::Complete),
            )]))
            .await
            .unwrap();
        assert!(failures.is_empty());

        let overwrites = destination
            .count_calls(&kv_id, |call| {
                matches!(call, StorageCall::OverwriteFinalTable { tmp_suffix } if tmp_suffix == TMP_TABLE_SUFFIX)
            })
            .await;
        assert_eq!(overwrites, 1);
        assert!(destination.wrapped().final_rows(&kv_id).await.is_empty());
        assert_eq!(typer.phase(&kv_id).await, Some(TypingPhase::FinalCommitted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn incomplete_refresh_keeps_existing_final_table() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let kv_id = stream_id(KV);

        let previous = build_catalog(vec![kv_stream(SyncMode::Append)]);
        let stream = previous.stream_by_id(&kv_id).unwrap();
        destination
            .create_final_table(stream, NO_SUFFIX, false)
            .await
            .unwrap();
        stage_kv(&destination, stream, "old", 1).await;
        destination
            .type_and_dedupe(stream, None, NO_SUFFIX)
            .await
            .unwrap();

        let typer = typer(&destination, vec![refresh(kv_stream(SyncMode::Append), 2)], 2);
        typer.prepare_tables().await.unwrap();
        typer
            .commit_final_tables(&HashMap::from([(
                kv_id.clone(),
                summary(StreamStatus::Incomplete),
            )]))
            .await
            .unwrap();

        assert_eq!(destination.wrapped().final_rows(&kv_id).await.len(), 1);
        assert_ne!(typer.phase(&kv_id).await, Some(TypingPhase::FinalCommitted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typing_waits_for_raw_table_inserts() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let kv_id = stream_id(KV);
        let typer = typer(&destination, vec![kv_stream(SyncMode::Append)], 2);
        typer.prepare_tables().await.unwrap();

        let lock = typer.raw_table_insert_lock(&kv_id).unwrap();
        let insert_guard = lock.lock().await;

        let typing = tokio::spawn({
            let typer = typer.clone();
            let kv_id = kv_id.clone();
            async move { typer.type_and_dedupe(&kv_id, None, NO_SUFFIX).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let is_typing = |call: &StorageCall| matches!(call, StorageCall::TypeAndDedupe { .. });
        assert_eq!(destination.count_calls(&kv_id, is_typing).await, 0);

        drop(insert_guard);
        typing.await.unwrap().unwrap();
        assert_eq!(destination.count_calls(&kv_id, is_typing).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typing_pool_bounds_concurrency_across_streams() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        destination.delay_typing(Duration::from_millis(50)).await;
        let typer = typer(
            &destination,
            vec![events_stream(SyncMode::Append), kv_stream(SyncMode::Append)],
            1,
        );
        typer.prepare_tables().await.unwrap();

        let events_id = stream_id(EVENTS);
        let kv_id = stream_id(KV);
        let (events, kv) = tokio::join!(
            typer.type_and_dedupe(&events_id, None, NO_SUFFIX),
            typer.type_and_dedupe(&kv_id, None, NO_SUFFIX),
        );
        events.unwrap();
        kv.unwrap();

        assert_eq!(destination.max_concurrent_typing().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typing_passes_of_one_stream_never_overlap() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        destination.delay_typing(Duration::from_millis(50)).await;
        let typer = typer(&destination, vec![kv_stream(SyncMode::Append)], 2);
        typer.prepare_tables().await.unwrap();

        let kv_id = stream_id(KV);
        let (first, second) = tokio::join!(
            typer.type_and_dedupe(&kv_id, None, NO_SUFFIX),
            typer.type_and_dedupe(&kv_id, None, NO_SUFFIX),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(destination.max_concurrent_typing().await, 1);
        let is_typing = |call: &StorageCall| matches!(call, StorageCall::TypeAndDedupe { .. });
        assert_eq!(destination.count_calls(&kv_id, is_typing).await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn namespace_failure_fails_setup() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        destination.fail_execute().await;
        let kv_id = stream_id(KV);
        let typer = typer(&destination, vec![kv_stream(SyncMode::Append)], 2);

        let err = typer.prepare_tables().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationNamespaceCreationFailed);
        assert!(err.kind().is_sync_scoped());

        let err = typer.prepared_stream(&kv_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamSetupFailed);

        typer.type_and_dedupe(&kv_id, None, NO_SUFFIX).await.unwrap();
        assert!(destination.calls(&kv_id).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typing_failure_is_recorded_and_skipped_at_commit() {
        init_test_tracing();
        let destination = TestStorageWrapper::wrap(MemoryDestination::new());
        let kv_id = stream_id(KV);
        let events_id = stream_id(EVENTS);
        destination.fail_typing_for(&kv_id).await;
        let typer = typer(
            &destination,
            vec![events_stream(SyncMode::Append), kv_stream(SyncMode::Append)],
            2,
        );
        typer.prepare_tables().await.unwrap();

        let err = typer
            .type_and_dedupe(&kv_id, None, NO_SUFFIX)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypingDedupingFailed);

        let summaries = HashMap::from([
            (kv_id.clone(), summary(StreamStatus::Complete)),
            (events_id.clone(), summary(StreamStatus::Complete)),
        ]);
        let failures = typer.commit_final_tables(&summaries).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(typer.phase(&events_id).await, Some(TypingPhase::FinalCommitted));
        assert_ne!(typer.phase(&kv_id).await, Some(TypingPhase::FinalCommitted));

        typer.cleanup().await.unwrap();
        typer.cleanup().await.unwrap();
        let err = typer
            .type_and_dedupe(&events_id, None, NO_SUFFIX)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerPoolShutdown);
    }
}
