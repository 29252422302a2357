use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, SyncResult};

/// Lock guarding a stream's raw table against concurrent mutation.
///
/// Record processing holds the lock in shared mode while inserting into the raw table, typing and
/// deduplication holds it exclusively. Destinations without contention on their raw tables use the
/// [`RawTableLock::Noop`] variant, which always succeeds and provides no exclusion.
#[derive(Debug, Clone)]
pub enum RawTableLock {
    Real(Arc<RwLock<()>>),
    Noop,
}

/// Proof of holding a [`RawTableLock`], releasing it when dropped.
#[derive(Debug)]
pub struct RawTableGuard {
    _inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
    Noop,
}

impl RawTableGuard {
    fn noop() -> Self {
        Self {
            _inner: GuardInner::Noop,
        }
    }

    fn is_exclusive(&self) -> bool {
        matches!(self._inner, GuardInner::Exclusive(_))
    }
}

impl RawTableLock {
    /// Creates a lock that provides mutual exclusion.
    pub fn real() -> Self {
        RawTableLock::Real(Arc::new(RwLock::new(())))
    }

    /// Acquires the lock for inserting, waiting as long as needed.
    pub async fn lock(&self) -> RawTableGuard {
        match self {
            RawTableLock::Real(lock) => RawTableGuard {
                _inner: GuardInner::Shared(lock.clone().read_owned().await),
            },
            RawTableLock::Noop => RawTableGuard::noop(),
        }
    }

    /// Acquires the lock for inserting unless shutdown is signalled first.
    pub async fn lock_interruptibly(
        &self,
        shutdown_rx: &mut ShutdownRx,
    ) -> ShutdownResult<RawTableGuard, ()> {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received while waiting for raw table lock");
                ShutdownResult::Shutdown(())
            }

            guard = self.lock() => ShutdownResult::Ok(guard),
        }
    }

    /// Acquires the lock for inserting if it is free right now.
    pub fn try_lock(&self) -> Option<RawTableGuard> {
        match self {
            RawTableLock::Real(lock) => lock.clone().try_read_owned().ok().map(|guard| RawTableGuard {
                _inner: GuardInner::Shared(guard),
            }),
            RawTableLock::Noop => Some(RawTableGuard::noop()),
        }
    }

    /// Acquires the lock for inserting, giving up after `timeout`.
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<RawTableGuard> {
        tokio::time::timeout(timeout, self.lock()).await.ok()
    }

    /// Acquires the lock exclusively, waiting as long as needed.
    pub async fn lock_exclusive(&self) -> RawTableGuard {
        match self {
            RawTableLock::Real(lock) => RawTableGuard {
                _inner: GuardInner::Exclusive(lock.clone().write_owned().await),
            },
            RawTableLock::Noop => RawTableGuard::noop(),
        }
    }

    /// Returns a wait/notify handle bound to this lock.
    ///
    /// Fails for [`RawTableLock::Noop`], which has nothing to wait on.
    pub fn new_condition(&self) -> SyncResult<LockCondition> {
        match self {
            RawTableLock::Real(_) => Ok(LockCondition {
                lock: self.clone(),
                notify: Arc::new(Notify::new()),
            }),
            RawTableLock::Noop => bail!(
                ErrorKind::UnsupportedLockOperation,
                "No-op lock has no conditions",
                "A no-op raw table lock provides no exclusion and cannot be waited on"
            ),
        }
    }
}

/// Wait/notify handle of a [`RawTableLock`].
#[derive(Debug, Clone)]
pub struct LockCondition {
    lock: RawTableLock,
    notify: Arc<Notify>,
}

impl LockCondition {
    /// Releases `guard`, waits for a notification and reacquires the lock in the same mode.
    pub async fn wait(&self, guard: RawTableGuard) -> RawTableGuard {
        let exclusive = guard.is_exclusive();

        // Registered before releasing the guard so a notification sent in between is not missed.
        let notified = self.notify.notified();
        drop(guard);
        notified.await;

        if exclusive {
            self.lock.lock_exclusive().await
        } else {
            self.lock.lock().await
        }
    }

    /// Wakes every task currently waiting on this condition.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;

    #[tokio::test(flavor = "multi_thread")]
    async fn exclusive_holder_blocks_inserts() {
        let lock = RawTableLock::real();

        let exclusive = lock.lock_exclusive().await;
        assert!(lock.try_lock().is_none());
        assert!(lock.try_lock_for(Duration::from_millis(20)).await.is_none());

        drop(exclusive);
        let first = lock.try_lock().unwrap();
        let second = lock.lock().await;
        drop((first, second));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interruptible_acquire_returns_on_shutdown() {
        let lock = RawTableLock::real();
        let (shutdown_tx, _) = create_shutdown_channel();
        let mut shutdown_rx = shutdown_tx.subscribe();

        let _exclusive = lock.lock_exclusive().await;
        shutdown_tx.shutdown().unwrap();

        let result = lock.lock_interruptibly(&mut shutdown_rx).await;
        assert!(result.should_shutdown());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn noop_lock_always_succeeds_and_rejects_conditions() {
        let lock = RawTableLock::Noop;

        let _first = lock.lock_exclusive().await;
        assert!(lock.try_lock().is_some());
        assert!(lock.try_lock_for(Duration::from_millis(1)).await.is_some());

        let err = lock.new_condition().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedLockOperation);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn condition_wait_reacquires_after_notification() {
        let lock = RawTableLock::real();
        let condition = lock.new_condition().unwrap();

        let waiter = {
            let lock = lock.clone();
            let condition = condition.clone();
            tokio::spawn(async move {
                let guard = lock.lock_exclusive().await;
                let guard = condition.wait(guard).await;
                guard.is_exclusive()
            })
        };

        // Notify until the waiter has registered and woken up.
        while !waiter.is_finished() {
            condition.notify_all();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(waiter.await.unwrap());
    }
}
