//! Engine moving records of a sync into a destination.
//!
//! Records are spooled per stream into local spill files, staged into raw tables by a bounded pool
//! of per-stream tasks and finally typed and deduplicated into final tables. [`pipeline::SyncPipeline`]
//! drives a whole sync, destinations plug in through the contracts of [`destination`].

pub mod concurrency;
pub mod destination;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
mod macros;
pub mod migration;
pub mod pipeline;
pub mod spool;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod typing;
pub mod workers;
