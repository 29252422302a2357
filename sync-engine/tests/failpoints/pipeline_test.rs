use std::sync::Arc;

use futures::stream;
use sync_config::shared::{SpoolConfig, SyncConfig};
use sync_engine::destination::memory::MemoryDestination;
use sync_engine::error::ErrorKind;
use sync_engine::failpoints::PROCESS_SPILL__AFTER_STAGE;
use sync_engine::migration::Migrator;
use sync_engine::state::lifecycle::StreamLifecycle;
use sync_engine::test_utils::catalog::{
    EVENTS, KV, build_catalog, complete, event, events_stream, kv, kv_stream, stream_id,
};
use sync_engine::test_utils::failpoints::CustomFailScenario;
use sync_engine::test_utils::pipeline::{TestDestination, create_pipeline};
use sync_engine::test_utils::storage::StorageCall;
use sync_engine::types::SyncMode;
use sync_telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn failure_after_staging_fails_stream_and_deletes_spill() {
    init_test_tracing();
    // The first processed batch fails after its records were staged, the others go through.
    let _scenario = CustomFailScenario::setup(&[(PROCESS_SPILL__AFTER_STAGE, "1*return->off")]);

    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let catalog = Arc::new(build_catalog(vec![kv_stream(SyncMode::Append)]));
    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            ..SpoolConfig::default()
        },
        ..SyncConfig::default()
    };

    let (pipeline, _checkpoint_rx) =
        create_pipeline(config, catalog, &destination, Migrator::empty());
    let messages = stream::iter(vec![kv("a", 1), kv("b", 2), complete(KV)]);
    let report = pipeline.run(messages).await.unwrap();

    let kv_id = stream_id(KV);
    let StreamLifecycle::Failed(err) = &report.stream(&kv_id).unwrap().lifecycle else {
        panic!("kv stream should have failed");
    };
    assert_eq!(err.kind(), ErrorKind::FailPoint);

    // The records reached the stage but were never typed.
    assert_eq!(
        destination
            .count_calls(&kv_id, |call| matches!(call, StorageCall::WriteToStage { .. }))
            .await,
        1
    );
    assert_eq!(
        destination
            .count_calls(&kv_id, |call| matches!(call, StorageCall::TypeAndDedupe { .. }))
            .await,
        0
    );
    assert!(destination.wrapped().final_rows(&kv_id).await.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_of_one_stream_leaves_the_other_committed() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(PROCESS_SPILL__AFTER_STAGE, "1*return->off")]);

    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let catalog = Arc::new(build_catalog(vec![
        events_stream(SyncMode::AppendDedup),
        kv_stream(SyncMode::AppendDedup),
    ]));
    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            ..SpoolConfig::default()
        },
        ..SyncConfig::default()
    };

    let (pipeline, _checkpoint_rx) =
        create_pipeline(config, catalog, &destination, Migrator::empty());
    let messages = stream::iter(vec![
        kv("a", 1),
        event(1, "first"),
        complete(KV),
        complete(EVENTS),
    ]);
    let report = pipeline.run(messages).await.unwrap();

    // Whichever stream was processed first failed, the other one was committed.
    let failed = report.failed_streams();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].1.kind(), ErrorKind::FailPoint);

    let committed = if failed[0].0 == &stream_id(KV) {
        stream_id(EVENTS)
    } else {
        stream_id(KV)
    };
    assert_eq!(
        report.stream(&committed).unwrap().lifecycle,
        StreamLifecycle::Complete
    );
    assert_eq!(destination.wrapped().final_rows(&committed).await.len(), 1);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
