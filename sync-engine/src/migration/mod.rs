//! Per-stream destination migrations.
//!
//! Migrations run during table preparation, before any record of the sync is staged. Each
//! migration checks the destination itself to decide whether it is needed, since a previous sync
//! may have crashed after migrating but before persisting its state. A migration may alter raw
//! tables and request a soft reset of the final table, it never performs the soft reset itself.
//! Requests of every migration of a stream are coalesced into the single
//! [`DestinationState::needs_soft_reset`] flag read by the typer.

use std::slice;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bail;
use crate::destination::DestinationHandler;
use crate::error::{ErrorKind, SyncResult};
use crate::state::destination::DestinationState;
use crate::state::initial::DestinationInitialStatus;

/// Outcome of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult<S> {
    /// State after the migration, carrying its soft reset request.
    pub updated_state: S,
    /// Whether the initial status the migration was given no longer reflects the destination.
    pub invalidate_initial_state: bool,
}

impl<S> MigrationResult<S> {
    /// A result for a migration that had nothing to do.
    pub fn unchanged(state: S) -> Self {
        Self {
            updated_state: state,
            invalidate_initial_state: false,
        }
    }
}

/// A corrective change applied to a stream's destination tables.
///
/// Implementations must be idempotent: running a migration on a destination it already migrated
/// returns the given state unchanged and does not invalidate the initial status.
#[async_trait]
pub trait Migration<H>: Send + Sync
where
    H: DestinationHandler,
{
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Migrates the stream described by `status` if the destination needs it.
    async fn migrate_if_necessary(
        &self,
        handler: &H,
        status: &DestinationInitialStatus<H::State>,
    ) -> SyncResult<MigrationResult<H::State>>;
}

/// Runs an ordered list of migrations for one stream at a time.
pub struct Migrator<H>
where
    H: DestinationHandler,
{
    migrations: Vec<Arc<dyn Migration<H>>>,
}

impl<H> Migrator<H>
where
    H: DestinationHandler,
{
    pub fn new(migrations: Vec<Arc<dyn Migration<H>>>) -> Self {
        Self { migrations }
    }

    /// A migrator without migrations.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Runs every migration for the stream of `status`, in order.
    ///
    /// Returns the status to continue the sync with. Its state carries the coalesced soft reset
    /// flag: set if the incoming state or any migration requested a soft reset. When a migration
    /// invalidates the initial status, a fresh one is gathered before the next migration runs.
    pub async fn run(
        &self,
        handler: &H,
        status: DestinationInitialStatus<H::State>,
    ) -> SyncResult<DestinationInitialStatus<H::State>> {
        let stream_id = status.stream_config.id.clone();
        let mut needs_soft_reset = status.destination_state.needs_soft_reset();
        let mut status = status;

        for migration in &self.migrations {
            debug!(stream = %stream_id, migration = migration.name(), "running migration");

            let result = migration.migrate_if_necessary(handler, &status).await?;
            needs_soft_reset |= result.updated_state.needs_soft_reset();

            if result.invalidate_initial_state {
                info!(
                    stream = %stream_id,
                    migration = migration.name(),
                    "migration invalidated initial status, gathering it again"
                );

                let mut gathered = handler
                    .gather_initial_state(slice::from_ref(&status.stream_config))
                    .await?;
                let Some(fresh) = gathered.pop() else {
                    bail!(
                        ErrorKind::MigrationFailed,
                        "Initial status missing after migration",
                        format!(
                            "Gathering the initial status of stream {stream_id} after migration {} returned nothing",
                            migration.name()
                        )
                    );
                };

                status = fresh.with_destination_state(result.updated_state);
            } else {
                status = status.with_destination_state(result.updated_state);
            }
        }

        if needs_soft_reset {
            info!(stream = %stream_id, "soft reset requested for stream");
        }

        let state = status.destination_state.with_soft_reset(needs_soft_reset);
        Ok(status.with_destination_state(state))
    }
}
