use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;
use crate::types::StreamId;
use crate::workers::loader::StreamLoader;

enum LoaderSlot<S, T> {
    Pending,
    Ready(Arc<StreamLoader<S, T>>),
    Failed(SyncError),
}

/// Per-stream loaders, created asynchronously while the sync already receives records.
///
/// Tasks needing a loader wait for it with [`StreamLoaders::wait_for`].
pub struct StreamLoaders<S, T> {
    slots: Arc<Mutex<HashMap<StreamId, LoaderSlot<S, T>>>>,
    changed: Arc<Notify>,
}

impl<S, T> Clone for StreamLoaders<S, T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            changed: Arc::clone(&self.changed),
        }
    }
}

impl<S, T> StreamLoaders<S, T> {
    /// Creates a registry expecting a loader for each of `stream_ids`.
    pub fn new<'a>(stream_ids: impl IntoIterator<Item = &'a StreamId>) -> Self {
        let slots = stream_ids
            .into_iter()
            .map(|stream_id| (stream_id.clone(), LoaderSlot::Pending))
            .collect();

        Self {
            slots: Arc::new(Mutex::new(slots)),
            changed: Arc::new(Notify::new()),
        }
    }

    pub async fn set_ready(&self, stream_id: &StreamId, loader: StreamLoader<S, T>) {
        debug!(stream = %stream_id, "stream loader ready");
        self.set(stream_id, LoaderSlot::Ready(Arc::new(loader)))
            .await;
    }

    pub async fn set_failed(&self, stream_id: &StreamId, err: SyncError) {
        info!(stream = %stream_id, error = %err, "stream loader failed to start");
        self.set(stream_id, LoaderSlot::Failed(err)).await;
    }

    /// Fails every loader that is still pending.
    pub async fn fail_pending(&self, err: &SyncError) {
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            if matches!(slot, LoaderSlot::Pending) {
                *slot = LoaderSlot::Failed(err.clone());
            }
        }
        self.changed.notify_waiters();
    }

    async fn set(&self, stream_id: &StreamId, slot: LoaderSlot<S, T>) {
        let mut slots = self.slots.lock().await;
        slots.insert(stream_id.clone(), slot);
        self.changed.notify_waiters();
    }

    /// Waits until the loader of a stream is available.
    ///
    /// Returns the error its creation failed with, or [`ErrorKind::StreamLoaderUnavailable`] if
    /// no loader is expected for the stream.
    pub async fn wait_for(
        &self,
        stream_id: &StreamId,
        shutdown_rx: &mut ShutdownRx,
    ) -> ShutdownResult<SyncResult<Arc<StreamLoader<S, T>>>, ()> {
        loop {
            let slots = self.slots.lock().await;

            match slots.get(stream_id) {
                Some(LoaderSlot::Ready(loader)) => return ShutdownResult::Ok(Ok(loader.clone())),
                Some(LoaderSlot::Failed(err)) => return ShutdownResult::Ok(Err(err.clone())),
                None => {
                    return ShutdownResult::Ok(Err(sync_error!(
                        ErrorKind::StreamLoaderUnavailable,
                        "No loader for stream",
                        format!("No loader is registered for stream {stream_id}")
                    )));
                }
                Some(LoaderSlot::Pending) => {}
            }

            // The notification future is created while holding the lock so a change made between
            // releasing it and awaiting cannot be missed.
            let changed = self.changed.notified();
            drop(slots);

            debug!(stream = %stream_id, "waiting for stream loader");

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!(stream = %stream_id, "shutdown signal received, cancelling wait for stream loader");

                    return ShutdownResult::Shutdown(());
                }

                _ = changed => {}
            }
        }
    }
}
