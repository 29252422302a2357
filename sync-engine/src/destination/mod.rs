//! Destination abstractions consumed by the engine.
//!
//! A destination plugs into the engine through three narrow contracts: [`StorageOperation`] for
//! every persistent write to stages and final tables, [`DestinationHandler`] for executing
//! statements and reading or persisting per-stream state, and [`sql::SqlGenerator`] for naming
//! and DDL. [`memory::MemoryDestination`] implements all of them in memory.

mod handler;
pub mod memory;
pub mod sql;
mod storage;

pub use handler::DestinationHandler;
pub use storage::{NO_SUFFIX, SOFT_RESET_SUFFIX, StorageOperation, TMP_TABLE_SUFFIX};
