use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::bail;
use crate::destination::sql::Sql;
use crate::destination::{DestinationHandler, StorageOperation};
use crate::error::{ErrorKind, SyncResult};
use crate::state::initial::DestinationInitialStatus;
use crate::test_utils::notify::TimedNotify;
use crate::types::{GenerationId, RecordMessage, StreamConfig, StreamId};

/// A call received by a [`TestStorageWrapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    PrepareStage { suffix: String, replace: bool },
    OverwriteStage { tmp_suffix: String },
    TransferFromTempStage { tmp_suffix: String },
    GetStageGeneration { suffix: String },
    CleanupStage,
    WriteToStage { suffix: String, records: usize },
    CreateFinalTable { suffix: String, replace: bool },
    SoftResetFinalTable,
    OverwriteFinalTable { tmp_suffix: String },
    TypeAndDedupe {
        final_suffix: String,
        max_processed_timestamp: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<StreamId, Vec<StorageCall>>,
    failing_writes: HashSet<StreamId>,
    failing_typing: HashSet<StreamId>,
    fail_execute: bool,
    typing_delay: Option<Duration>,
    typing_in_flight: usize,
    max_typing_in_flight: usize,
    write_conditions: Vec<(StreamId, usize, Arc<Notify>)>,
}

impl Inner {
    fn check_write_conditions(&mut self) {
        let calls = &self.calls;
        self.write_conditions.retain(|(stream_id, count, notify)| {
            let writes = calls
                .get(stream_id)
                .map(|calls| {
                    calls
                        .iter()
                        .filter(|call| matches!(call, StorageCall::WriteToStage { .. }))
                        .count()
                })
                .unwrap_or_default();
            let should_retain = writes < *count;
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Test wrapper around a destination that records every storage call per stream.
///
/// Failures can be injected per stream into stage writes and typing, and into statement
/// execution. Typing calls can be slowed down to observe how many run at the same time.
#[derive(Debug)]
pub struct TestStorageWrapper<D> {
    wrapped: D,
    inner: Arc<Mutex<Inner>>,
}

impl<D: Clone> Clone for TestStorageWrapper<D> {
    fn clone(&self) -> Self {
        Self {
            wrapped: self.wrapped.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> TestStorageWrapper<D> {
    pub fn wrap(destination: D) -> Self {
        Self {
            wrapped: destination,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns the wrapped destination.
    pub fn wrapped(&self) -> &D {
        &self.wrapped
    }

    /// Returns the calls received for a stream, in order.
    pub async fn calls(&self, stream_id: &StreamId) -> Vec<StorageCall> {
        let inner = self.inner.lock().await;
        inner.calls.get(stream_id).cloned().unwrap_or_default()
    }

    /// Counts the calls received for a stream that match `predicate`.
    pub async fn count_calls<F>(&self, stream_id: &StreamId, predicate: F) -> usize
    where
        F: Fn(&StorageCall) -> bool,
    {
        self.calls(stream_id)
            .await
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Makes every stage write of a stream fail.
    pub async fn fail_writes_for(&self, stream_id: &StreamId) {
        let mut inner = self.inner.lock().await;
        inner.failing_writes.insert(stream_id.clone());
    }

    /// Makes every typing call of a stream fail.
    pub async fn fail_typing_for(&self, stream_id: &StreamId) {
        let mut inner = self.inner.lock().await;
        inner.failing_typing.insert(stream_id.clone());
    }

    /// Makes statement execution fail.
    pub async fn fail_execute(&self) {
        let mut inner = self.inner.lock().await;
        inner.fail_execute = true;
    }

    /// Delays every typing call by `delay`.
    pub async fn delay_typing(&self, delay: Duration) {
        let mut inner = self.inner.lock().await;
        inner.typing_delay = Some(delay);
    }

    /// Registers a notification fired once a stream received `count` stage writes.
    pub async fn notify_on_writes(&self, stream_id: &StreamId, count: usize) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        inner
            .write_conditions
            .push((stream_id.clone(), count, notify.clone()));
        inner.check_write_conditions();

        TimedNotify::new(notify)
    }

    /// Returns the highest number of typing calls observed running at once.
    pub async fn max_concurrent_typing(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.max_typing_in_flight
    }

    async fn record(&self, stream_id: &StreamId, call: StorageCall) {
        let mut inner = self.inner.lock().await;
        inner.calls.entry(stream_id.clone()).or_default().push(call);
    }
}

impl<D> StorageOperation for TestStorageWrapper<D>
where
    D: StorageOperation,
{
    async fn prepare_stage(&self, stream_id: &StreamId, suffix: &str, replace: bool) -> SyncResult<()> {
        self.record(
            stream_id,
            StorageCall::PrepareStage {
                suffix: suffix.to_string(),
                replace,
            },
        )
        .await;
        self.wrapped.prepare_stage(stream_id, suffix, replace).await
    }

    async fn overwrite_stage(&self, stream_id: &StreamId, tmp_suffix: &str) -> SyncResult<()> {
        self.record(
            stream_id,
            StorageCall::OverwriteStage {
                tmp_suffix: tmp_suffix.to_string(),
            },
        )
        .await;
        self.wrapped.overwrite_stage(stream_id, tmp_suffix).await
    }

    async fn transfer_from_temp_stage(
        &self,
        stream_id: &StreamId,
        tmp_suffix: &str,
    ) -> SyncResult<()> {
        self.record(
            stream_id,
            StorageCall::TransferFromTempStage {
                tmp_suffix: tmp_suffix.to_string(),
            },
        )
        .await;
        self.wrapped
            .transfer_from_temp_stage(stream_id, tmp_suffix)
            .await
    }

    async fn get_stage_generation(
        &self,
        stream_id: &StreamId,
        suffix: &str,
    ) -> SyncResult<Option<GenerationId>> {
        self.record(
            stream_id,
            StorageCall::GetStageGeneration {
                suffix: suffix.to_string(),
            },
        )
        .await;
        self.wrapped.get_stage_generation(stream_id, suffix).await
    }

    async fn cleanup_stage(&self, stream_id: &StreamId) -> SyncResult<()> {
        self.record(stream_id, StorageCall::CleanupStage).await;
        self.wrapped.cleanup_stage(stream_id).await
    }

    async fn write_to_stage(
        &self,
        stream: &StreamConfig,
        suffix: &str,
        records: Vec<RecordMessage>,
    ) -> SyncResult<()> {
        self.record(
            &stream.id,
            StorageCall::WriteToStage {
                suffix: suffix.to_string(),
                records: records.len(),
            },
        )
        .await;

        let fail = {
            let mut inner = self.inner.lock().await;
            inner.check_write_conditions();
            inner.failing_writes.contains(&stream.id)
        };
        if fail {
            bail!(
                ErrorKind::DestinationError,
                "Injected stage write failure",
                format!("Writes to the stage of stream {} are set to fail", stream.id)
            );
        }

        self.wrapped.write_to_stage(stream, suffix, records).await
    }

    async fn create_final_table(
        &self,
        stream: &StreamConfig,
        suffix: &str,
        replace: bool,
    ) -> SyncResult<()> {
        self.record(
            &stream.id,
            StorageCall::CreateFinalTable {
                suffix: suffix.to_string(),
                replace,
            },
        )
        .await;
        self.wrapped.create_final_table(stream, suffix, replace).await
    }

    async fn soft_reset_final_table(&self, stream: &StreamConfig) -> SyncResult<()> {
        self.record(&stream.id, StorageCall::SoftResetFinalTable).await;
        self.wrapped.soft_reset_final_table(stream).await
    }

    async fn overwrite_final_table(&self, stream_id: &StreamId, tmp_suffix: &str) -> SyncResult<()> {
        self.record(
            stream_id,
            StorageCall::OverwriteFinalTable {
                tmp_suffix: tmp_suffix.to_string(),
            },
        )
        .await;
        self.wrapped.overwrite_final_table(stream_id, tmp_suffix).await
    }

    async fn type_and_dedupe(
        &self,
        stream: &StreamConfig,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> SyncResult<()> {
        self.record(
            &stream.id,
            StorageCall::TypeAndDedupe {
                final_suffix: final_suffix.to_string(),
                max_processed_timestamp,
            },
        )
        .await;

        let (fail, delay) = {
            let mut inner = self.inner.lock().await;
            inner.typing_in_flight += 1;
            inner.max_typing_in_flight = inner.max_typing_in_flight.max(inner.typing_in_flight);
            (
                inner.failing_typing.contains(&stream.id),
                inner.typing_delay,
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if fail {
            Err(crate::sync_error!(
                ErrorKind::TypingDedupingFailed,
                "Injected typing failure",
                format!("Typing of stream {} is set to fail", stream.id)
            ))
        } else {
            self.wrapped
                .type_and_dedupe(stream, max_processed_timestamp, final_suffix)
                .await
        };

        self.inner.lock().await.typing_in_flight -= 1;

        result
    }
}

impl<D> DestinationHandler for TestStorageWrapper<D>
where
    D: DestinationHandler,
{
    type State = D::State;

    async fn execute(&self, sql: Sql) -> SyncResult<()> {
        let fail = self.inner.lock().await.fail_execute;
        if fail {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "Injected execution failure",
                format!("Executing {sql} is set to fail")
            );
        }

        self.wrapped.execute(sql).await
    }

    async fn gather_initial_state(
        &self,
        streams: &[StreamConfig],
    ) -> SyncResult<Vec<DestinationInitialStatus<D::State>>> {
        self.wrapped.gather_initial_state(streams).await
    }

    async fn commit_destination_states(
        &self,
        states: HashMap<StreamId, D::State>,
    ) -> SyncResult<()> {
        self.wrapped.commit_destination_states(states).await
    }
}
