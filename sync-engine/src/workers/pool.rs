use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;
use crate::types::{Batch, StreamId};

/// Outcome of a task run on the [`StreamTaskPool`].
#[derive(Debug)]
pub enum TaskOutcome {
    /// A batch was staged, carrying the result batch.
    Processed(SyncResult<Batch>),
    /// A mid-sync typing pass ran after staging the batch.
    Typed(SyncResult<Batch>),
    /// The stream was closed.
    Closed(SyncResult<()>),
}

/// Bounded pool running per-stream tasks.
///
/// At most `max_workers` tasks do work at the same time, the others wait for a permit inside
/// their task.
#[derive(Debug)]
pub struct StreamTaskPool {
    join_set: JoinSet<(StreamId, TaskOutcome)>,
    permits: Arc<Semaphore>,
}

impl StreamTaskPool {
    pub fn new(max_workers: u16) -> Self {
        Self {
            join_set: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_workers as usize)),
        }
    }

    /// Spawns a task for a stream.
    ///
    /// The outcome is built from the result of `future` by `outcome`. A task spawned after
    /// [`StreamTaskPool::shutdown`] fails with [`ErrorKind::WorkerPoolShutdown`].
    pub fn spawn<F, R>(
        &mut self,
        stream_id: StreamId,
        future: F,
        outcome: fn(SyncResult<R>) -> TaskOutcome,
    ) where
        F: Future<Output = SyncResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_or_else(stream_id, future, async {}, outcome);
    }

    /// Spawns a task for a stream, running `rejected` instead of `future` if the pool shuts down
    /// before the task gets a permit.
    pub fn spawn_or_else<F, C, R>(
        &mut self,
        stream_id: StreamId,
        future: F,
        rejected: C,
        outcome: fn(SyncResult<R>) -> TaskOutcome,
    ) where
        F: Future<Output = SyncResult<R>> + Send + 'static,
        C: Future<Output = ()> + Send + 'static,
        R: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);

        self.join_set.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => future.await,
                Err(_) => {
                    debug!(stream = %stream_id, "stream task rejected by shut down pool");
                    rejected.await;
                    Err(sync_error!(
                        ErrorKind::WorkerPoolShutdown,
                        "Stream task pool is shut down",
                        format!("Task of stream {stream_id} was not started")
                    ))
                }
            };

            (stream_id, outcome(result))
        });

        debug!(tasks = self.join_set.len(), "spawned stream task");
    }

    pub fn has_tasks(&self) -> bool {
        !self.join_set.is_empty()
    }

    /// Waits for the next task to finish.
    ///
    /// Returns `None` when no task is running. A panicking task yields a
    /// [`ErrorKind::TaskPanic`] error.
    pub async fn join_next(&mut self) -> Option<SyncResult<(StreamId, TaskOutcome)>> {
        let joined = self.join_set.join_next().await?;

        Some(joined.map_err(|err| {
            sync_error!(ErrorKind::TaskPanic, "Stream task panicked", err)
        }))
    }

    /// Stops handing out permits. Tasks already running finish normally.
    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            info!("stream task pool shut down");
        }
    }
}
