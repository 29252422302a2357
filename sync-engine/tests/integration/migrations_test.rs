use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use sync_engine::destination::memory::MemoryDestination;
use sync_engine::error::SyncResult;
use sync_engine::migration::{Migration, MigrationResult, Migrator};
use sync_engine::state::destination::{DestinationState, MinimumDestinationState};
use sync_engine::state::initial::DestinationInitialStatus;
use sync_engine::test_utils::catalog::{
    EVENTS, KV, build_catalog, complete, event, events_stream, kv, kv_stream, stream_id,
};
use sync_engine::test_utils::pipeline::{TestDestination, create_pipeline, test_config};
use sync_engine::test_utils::storage::StorageCall;
use sync_engine::types::SyncMode;
use sync_engine::typing::TypingPhase;
use sync_telemetry::init_test_tracing;

/// Requests a soft reset of every stream it runs for.
struct RequestSoftReset {
    name: &'static str,
}

#[async_trait]
impl Migration<TestDestination> for RequestSoftReset {
    fn name(&self) -> &str {
        self.name
    }

    async fn migrate_if_necessary(
        &self,
        _handler: &TestDestination,
        status: &DestinationInitialStatus<MinimumDestinationState>,
    ) -> SyncResult<MigrationResult<MinimumDestinationState>> {
        Ok(MigrationResult {
            updated_state: status.destination_state.with_soft_reset(true),
            invalidate_initial_state: false,
        })
    }
}

fn soft_reset_migrator() -> Migrator<TestDestination> {
    let migrations: Vec<Arc<dyn Migration<TestDestination>>> = vec![
        Arc::new(RequestSoftReset {
            name: "rename_columns",
        }),
        Arc::new(RequestSoftReset {
            name: "change_column_types",
        }),
    ];

    Migrator::new(migrations)
}

fn is_soft_reset(call: &StorageCall) -> bool {
    matches!(call, StorageCall::SoftResetFinalTable)
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_reset_requests_of_several_migrations_run_once() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let catalog = Arc::new(build_catalog(vec![
        events_stream(SyncMode::AppendDedup),
        kv_stream(SyncMode::AppendDedup),
    ]));

    // A first sync creates the final tables.
    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog.clone(),
        &destination,
        Migrator::empty(),
    );
    let messages = stream::iter(vec![event(1, "first"), kv("a", 1), complete(EVENTS), complete(KV)]);
    assert!(pipeline.run(messages).await.unwrap().is_success());

    // The second sync runs two migrations that both request a soft reset. Events are typed during
    // the sync, kv receives no record and is only reset when committing.
    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog,
        &destination,
        soft_reset_migrator(),
    );
    let typer = pipeline.typer().clone();
    let messages = stream::iter(vec![event(2, "second"), complete(EVENTS), complete(KV)]);
    assert!(pipeline.run(messages).await.unwrap().is_success());

    for name in [EVENTS, KV] {
        let id = stream_id(name);

        assert_eq!(destination.count_calls(&id, is_soft_reset).await, 1);
        assert!(!typer.is_soft_reset_pending(&id).await);
        assert_eq!(typer.phase(&id).await, Some(TypingPhase::FinalCommitted));

        let state = destination.wrapped().destination_state(&id).await.unwrap();
        assert!(!state.needs_soft_reset());
    }

    assert_eq!(
        destination
            .wrapped()
            .final_rows(&stream_id(EVENTS))
            .await
            .len(),
        2
    );
}
