use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream;
use serde_json::json;
use sync_config::shared::{SpoolConfig, SyncConfig, TypingConfig};
use sync_engine::destination::memory::MemoryDestination;
use sync_engine::destination::{DestinationHandler, NO_SUFFIX, StorageOperation, TMP_TABLE_SUFFIX};
use sync_engine::error::ErrorKind;
use sync_engine::migration::Migrator;
use sync_engine::pipeline::SyncPipeline;
use sync_engine::state::destination::DestinationState;
use sync_engine::state::lifecycle::StreamLifecycle;
use sync_engine::test_utils::catalog::{
    EVENTS, KV, build_catalog, complete, event, events_stream, global_checkpoint, kv, kv_stream,
    refresh, status, stream_checkpoint, stream_id,
};
use sync_engine::test_utils::pipeline::{TestDestination, create_pipeline, test_config};
use sync_engine::test_utils::storage::{StorageCall, TestStorageWrapper};
use sync_engine::types::{RecordMessage, StreamStatus, SyncMode};
use sync_engine::typing::{NoOpTyperDeduper, TypingPhase};
use sync_telemetry::init_test_tracing;
use tokio::sync::mpsc;

fn both_streams(sync_mode: SyncMode) -> Arc<sync_engine::types::Catalog> {
    Arc::new(build_catalog(vec![
        events_stream(sync_mode),
        kv_stream(sync_mode),
    ]))
}

fn is_write(call: &StorageCall) -> bool {
    matches!(call, StorageCall::WriteToStage { .. })
}

fn is_typing(call: &StorageCall) -> bool {
    matches!(call, StorageCall::TypeAndDedupe { .. })
}

#[tokio::test(flavor = "multi_thread")]
async fn two_streams_are_committed_end_to_end() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let catalog = both_streams(SyncMode::AppendDedup);

    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog,
        &destination,
        Migrator::empty(),
    );
    let typer = pipeline.typer().clone();

    let messages = stream::iter(vec![
        event(1, "first"),
        kv("a", 1),
        event(2, "second"),
        kv("b", 2),
        event(3, "third"),
        kv("c", 3),
        complete(EVENTS),
        complete(KV),
    ]);
    let report = pipeline.run(messages).await.unwrap();

    assert!(report.is_success());
    for name in [EVENTS, KV] {
        let id = stream_id(name);

        assert_eq!(typer.phase(&id).await, Some(TypingPhase::FinalCommitted));
        assert_eq!(destination.wrapped().final_rows(&id).await.len(), 3);

        let state = destination.wrapped().destination_state(&id).await.unwrap();
        assert!(!state.needs_soft_reset());

        let summary = report.stream(&id).unwrap().summary.unwrap();
        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.terminal_status, StreamStatus::Complete);
    }

    // Every spill file was handed off and deleted.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_are_acknowledged_in_order_with_their_record_counts() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());

    let (pipeline, mut checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![
        kv("a", 1),
        kv("b", 2),
        stream_checkpoint(KV, json!({ "cursor": 2 })),
        event(1, "first"),
        kv("c", 3),
        stream_checkpoint(KV, json!({ "cursor": 3 })),
        stream_checkpoint(EVENTS, json!({ "cursor": 1 })),
        complete(KV),
        complete(EVENTS),
    ]);
    pipeline.run(messages).await.unwrap();

    let mut kv_acks = Vec::new();
    let mut events_acks = Vec::new();
    while let Ok(acknowledged) = checkpoint_rx.try_recv() {
        match acknowledged.checkpoint.data["cursor"].as_i64() {
            Some(1) => events_acks.push(acknowledged),
            _ => kv_acks.push(acknowledged),
        }
    }

    assert_eq!(kv_acks.len(), 2);
    assert_eq!(kv_acks[0].checkpoint.data, json!({ "cursor": 2 }));
    assert_eq!(kv_acks[0].record_count, 2);
    assert_eq!(kv_acks[1].checkpoint.data, json!({ "cursor": 3 }));
    assert_eq!(kv_acks[1].record_count, 1);

    assert_eq!(events_acks.len(), 1);
    assert_eq!(events_acks[0].record_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn mixing_checkpoint_scopes_aborts_the_sync() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());

    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![
        kv("a", 1),
        stream_checkpoint(KV, json!({ "cursor": 1 })),
        global_checkpoint(json!({ "position": 1 })),
        complete(KV),
    ]);
    let err = pipeline.run(messages).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidData);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_stream_does_not_affect_other_streams() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    destination.fail_writes_for(&stream_id(KV)).await;

    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            max_batch_records: 1,
            ..SpoolConfig::default()
        },
        ..SyncConfig::default()
    };
    let (pipeline, _checkpoint_rx) = create_pipeline(
        config,
        both_streams(SyncMode::AppendDedup),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![
        kv("a", 1),
        event(1, "first"),
        kv("b", 2),
        event(2, "second"),
        kv("c", 3),
        event(3, "third"),
        complete(KV),
        complete(EVENTS),
    ]);
    let report = pipeline.run(messages).await.unwrap();

    assert!(!report.is_success());
    let failed = report.failed_streams();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, &stream_id(KV));
    assert_eq!(failed[0].1.kind(), ErrorKind::DestinationError);

    assert_eq!(
        report.stream(&stream_id(EVENTS)).unwrap().lifecycle,
        StreamLifecycle::Complete
    );
    assert_eq!(
        destination
            .wrapped()
            .final_rows(&stream_id(EVENTS))
            .await
            .len(),
        3
    );
    assert!(
        destination
            .wrapped()
            .final_rows(&stream_id(KV))
            .await
            .is_empty()
    );
    assert_eq!(destination.count_calls(&stream_id(KV), is_typing).await, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_discards_temp_stage_of_previous_generation() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let kv_id = stream_id(KV);

    // A previous attempt of generation 1 left a temp stage behind.
    let stale = build_catalog(vec![refresh(kv_stream(SyncMode::AppendDedup), 1)]);
    let stale_stream = stale.stream_by_id(&kv_id).unwrap();
    let memory = destination.wrapped();
    memory
        .prepare_stage(&kv_id, TMP_TABLE_SUFFIX, false)
        .await
        .unwrap();
    memory
        .write_to_stage(
            stale_stream,
            TMP_TABLE_SUFFIX,
            vec![RecordMessage::new(
                kv_id.descriptor(),
                json!({ "K": "stale", "V": 0 }),
                Utc::now(),
            )],
        )
        .await
        .unwrap();
    assert_eq!(
        memory
            .get_stage_generation(&kv_id, TMP_TABLE_SUFFIX)
            .await
            .unwrap(),
        Some(1)
    );

    let catalog = Arc::new(build_catalog(vec![refresh(
        kv_stream(SyncMode::AppendDedup),
        2,
    )]));
    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog,
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![kv("a", 1), kv("b", 2), complete(KV)]);
    let report = pipeline.run(messages).await.unwrap();
    assert!(report.is_success());

    assert!(
        destination
            .calls(&kv_id)
            .await
            .contains(&StorageCall::PrepareStage {
                suffix: TMP_TABLE_SUFFIX.to_string(),
                replace: true,
            })
    );
    assert_eq!(
        memory.get_stage_generation(&kv_id, NO_SUFFIX).await.unwrap(),
        Some(2)
    );

    let rows = memory.final_rows(&kv_id).await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.get("k") != Some(&json!("stale"))));
}

#[tokio::test(flavor = "multi_thread")]
async fn incomplete_refresh_keeps_previous_raw_table() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let kv_id = stream_id(KV);

    let catalog = Arc::new(build_catalog(vec![refresh(
        kv_stream(SyncMode::AppendDedup),
        1,
    )]));
    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog,
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![
        kv("a", 1),
        status(KV, StreamStatus::Incomplete),
    ]);
    let report = pipeline.run(messages).await.unwrap();

    let kv_report = report.stream(&kv_id).unwrap();
    assert_eq!(kv_report.lifecycle, StreamLifecycle::Complete);
    assert_eq!(
        kv_report.summary.unwrap().terminal_status,
        StreamStatus::Incomplete
    );
    assert!(!report.is_success());
    assert_eq!(
        destination
            .count_calls(&kv_id, |call| matches!(call, StorageCall::OverwriteStage { .. }))
            .await,
        0
    );
    assert_eq!(destination.count_calls(&kv_id, is_typing).await, 0);
    assert!(destination.wrapped().final_rows(&kv_id).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_without_status_are_closed_as_incomplete() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());

    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![kv("a", 1), complete(KV)]);
    let report = pipeline.run(messages).await.unwrap();

    let events = report.stream(&stream_id(EVENTS)).unwrap();
    let summary = events.summary.unwrap();
    assert_eq!(summary.terminal_status, StreamStatus::Incomplete);
    assert_eq!(summary.records_written, 0);
    assert_eq!(events.lifecycle, StreamLifecycle::Complete);
    assert!(!report.is_success());

    assert_eq!(
        destination.wrapped().final_rows(&stream_id(KV)).await.len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn no_op_typer_stages_records_without_typing() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestStorageWrapper::wrap(MemoryDestination::<sync_engine::state::destination::MinimumDestinationState>::new());
    let (checkpoint_tx, _checkpoint_rx) = mpsc::unbounded_channel();

    let pipeline = SyncPipeline::new(
        test_config(dir.path()),
        both_streams(SyncMode::Append),
        destination.clone(),
        NoOpTyperDeduper::new(),
        checkpoint_tx,
    );

    let messages = stream::iter(vec![
        kv("a", 1),
        kv("b", 2),
        kv("c", 3),
        complete(KV),
        complete(EVENTS),
    ]);
    let report = pipeline.run(messages).await.unwrap();
    assert!(report.is_success());

    let kv_id = stream_id(KV);
    let staged = destination
        .wrapped()
        .stage_records(&kv_id, NO_SUFFIX)
        .await
        .unwrap();
    assert_eq!(staged.len(), 3);
    assert_eq!(destination.count_calls(&kv_id, is_typing).await, 0);
    assert!(!destination.wrapped().final_table_exists(&kv_id, NO_SUFFIX).await);
    assert!(destination.wrapped().namespaces().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_typing_runs_between_batches() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let kv_id = stream_id(KV);

    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            max_batch_records: 1,
            ..SpoolConfig::default()
        },
        typing: TypingConfig {
            incremental_interval_ms: Some(0),
            ..TypingConfig::default()
        },
        ..SyncConfig::default()
    };
    let catalog = Arc::new(build_catalog(vec![kv_stream(SyncMode::Append)]));
    let (pipeline, _checkpoint_rx) =
        create_pipeline(config, catalog, &destination, Migrator::empty());

    let messages = stream::iter(vec![kv("a", 1), kv("b", 2), kv("c", 3), complete(KV)]);
    let report = pipeline.run(messages).await.unwrap();
    assert!(report.is_success());

    // One pass after each staged record, then the final pass when the stream closes.
    assert_eq!(destination.count_calls(&kv_id, is_write).await, 3);
    assert_eq!(destination.count_calls(&kv_id, is_typing).await, 4);
    assert_eq!(destination.wrapped().final_rows(&kv_id).await.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_the_sync() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let kv_id = stream_id(KV);

    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            max_batch_records: 1,
            ..SpoolConfig::default()
        },
        ..SyncConfig::default()
    };
    let (pipeline, _checkpoint_rx) = create_pipeline(
        config,
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );
    let shutdown_tx = pipeline.shutdown_tx();
    let first_write = destination.notify_on_writes(&kv_id, 1).await;

    let (messages_tx, messages_rx) = futures::channel::mpsc::unbounded();
    let driver = async move {
        messages_tx.unbounded_send(kv("a", 1)).unwrap();
        messages_tx.unbounded_send(event(1, "first")).unwrap();

        first_write.notified().await;
        shutdown_tx.shutdown().unwrap();

        // The input stays open, only the shutdown ends the sync.
        messages_tx
    };

    let (result, _messages_tx) = tokio::join!(pipeline.run(messages_rx), driver);

    assert_eq!(result.unwrap_err().kind(), ErrorKind::SyncCancelled);
    assert_eq!(destination.count_calls(&kv_id, is_typing).await, 0);
    assert!(
        destination
            .wrapped()
            .destination_state(&kv_id)
            .await
            .is_some_and(|state| !state.needs_soft_reset())
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_failure_aborts_the_sync() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    destination.fail_execute().await;

    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![kv("a", 1), complete(KV), complete(EVENTS)]);
    let err = pipeline.run(messages).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationNamespaceCreationFailed);
    assert!(destination.wrapped().namespaces().await.is_empty());
    assert_eq!(destination.count_calls(&stream_id(KV), is_write).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_stream_aborts_the_sync() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());

    let catalog = Arc::new(build_catalog(vec![kv_stream(SyncMode::Append)]));
    let (pipeline, _checkpoint_rx) =
        create_pipeline(test_config(dir.path()), catalog, &destination, Migrator::empty());

    let messages = stream::iter(vec![kv("a", 1), event(1, "first"), complete(KV)]);
    let err = pipeline.run(messages).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownStream);
}

// The handler and the storage are the same destination, states written through one are visible
// through the other.
#[tokio::test(flavor = "multi_thread")]
async fn states_are_persisted_through_the_handler() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let catalog = both_streams(SyncMode::Append);

    let (pipeline, _checkpoint_rx) = create_pipeline(
        test_config(dir.path()),
        catalog.clone(),
        &destination,
        Migrator::empty(),
    );
    pipeline
        .run(stream::iter(vec![complete(KV), complete(EVENTS)]))
        .await
        .unwrap();

    let statuses = destination
        .gather_initial_state(catalog.streams())
        .await
        .unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(
        statuses
            .iter()
            .all(|status| status.is_final_table_present && !status.destination_state.needs_soft_reset())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configuration_is_rejected_before_syncing() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let events_id = stream_id(EVENTS);

    let invalid_configs = [
        SyncConfig {
            stage_write_batch_size: 0,
            ..test_config(dir.path())
        },
        SyncConfig {
            max_processing_workers: 0,
            ..test_config(dir.path())
        },
        SyncConfig {
            typing: TypingConfig {
                max_workers: 0,
                ..TypingConfig::default()
            },
            ..test_config(dir.path())
        },
        SyncConfig {
            spool: SpoolConfig {
                directory: Some(dir.path().to_path_buf()),
                max_batch_records: 0,
                ..SpoolConfig::default()
            },
            ..test_config(dir.path())
        },
    ];

    for config in invalid_configs {
        let destination = TestDestination::wrap(MemoryDestination::new());
        let (pipeline, mut checkpoint_rx) = create_pipeline(
            config,
            both_streams(SyncMode::Append),
            &destination,
            Migrator::empty(),
        );

        let messages = stream::iter(vec![
            event(1, "first"),
            event(2, "second"),
            stream_checkpoint(EVENTS, json!({ "cursor": 2 })),
            complete(EVENTS),
            complete(KV),
        ]);
        let err = tokio::time::timeout(Duration::from_secs(5), pipeline.run(messages))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(destination.calls(&events_id).await.is_empty());
        assert!(destination.wrapped().executed_statements().await.is_empty());
        assert!(checkpoint_rx.try_recv().is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_writes_larger_than_batches_stage_every_record() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let destination = TestDestination::wrap(MemoryDestination::new());
    let events_id = stream_id(EVENTS);

    let config = SyncConfig {
        spool: SpoolConfig {
            directory: Some(dir.path().to_path_buf()),
            max_batch_records: 1,
            ..SpoolConfig::default()
        },
        stage_write_batch_size: 10,
        ..SyncConfig::default()
    };
    let (pipeline, mut checkpoint_rx) = create_pipeline(
        config,
        both_streams(SyncMode::Append),
        &destination,
        Migrator::empty(),
    );

    let messages = stream::iter(vec![
        event(1, "first"),
        event(2, "second"),
        event(3, "third"),
        stream_checkpoint(EVENTS, json!({ "cursor": 3 })),
        complete(EVENTS),
        complete(KV),
    ]);
    let report = pipeline.run(messages).await.unwrap();
    assert!(report.is_success());

    let writes: Vec<_> = destination
        .calls(&events_id)
        .await
        .into_iter()
        .filter(is_write)
        .collect();
    assert_eq!(writes.len(), 3);
    assert!(
        writes
            .iter()
            .all(|call| matches!(call, StorageCall::WriteToStage { records: 1, .. }))
    );
    assert_eq!(destination.wrapped().final_rows(&events_id).await.len(), 3);

    let acknowledged = checkpoint_rx.try_recv().unwrap();
    assert_eq!(acknowledged.record_count, 3);
}
