use std::path::Path;
use std::sync::Arc;

use sync_config::shared::{SpoolConfig, SyncConfig};
use tokio::sync::mpsc;

use crate::destination::memory::{MemoryDestination, MemorySqlGenerator};
use crate::migration::Migrator;
use crate::pipeline::SyncPipeline;
use crate::state::checkpoint::AcknowledgedCheckpoint;
use crate::test_utils::storage::TestStorageWrapper;
use crate::types::Catalog;
use crate::typing::DefaultTyperDeduper;

pub type TestDestination = TestStorageWrapper<MemoryDestination>;

pub type TestTyper = DefaultTyperDeduper<TestDestination, TestDestination>;

pub type TestPipeline = SyncPipeline<TestDestination, TestTyper>;

/// Returns the default configuration, spilling into `directory`.
pub fn test_config(directory: &Path) -> SyncConfig {
    SyncConfig {
        spool: SpoolConfig {
            directory: Some(directory.to_path_buf()),
            ..SpoolConfig::default()
        },
        ..SyncConfig::default()
    }
}

pub fn create_typer(
    destination: &TestDestination,
    catalog: Arc<Catalog>,
    migrator: Migrator<TestDestination>,
    config: &SyncConfig,
) -> TestTyper {
    DefaultTyperDeduper::new(
        destination.clone(),
        destination.clone(),
        Arc::new(MemorySqlGenerator),
        migrator,
        catalog,
        &config.typing,
    )
}

/// Creates a pipeline typing into `destination`, along with the receiver of its acknowledged
/// checkpoints.
pub fn create_pipeline(
    config: SyncConfig,
    catalog: Arc<Catalog>,
    destination: &TestDestination,
    migrator: Migrator<TestDestination>,
) -> (TestPipeline, mpsc::UnboundedReceiver<AcknowledgedCheckpoint>) {
    let typer = create_typer(destination, catalog.clone(), migrator, &config);
    let (checkpoint_tx, checkpoint_rx) = mpsc::unbounded_channel();

    let pipeline = SyncPipeline::new(config, catalog, destination.clone(), typer, checkpoint_tx);

    (pipeline, checkpoint_rx)
}
