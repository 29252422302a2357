//! Tasks moving spooled batches of every stream into the destination.
//!
//! [`TaskManager`] sequences the tasks of each stream on a bounded [`StreamTaskPool`]. Each task
//! borrows the stream's [`StreamLoader`] from [`StreamLoaders`] once table preparation made it
//! available.

mod loader;
mod manager;
mod pool;
mod process;
mod registry;

pub use loader::StreamLoader;
pub use manager::TaskManager;
pub use pool::{StreamTaskPool, TaskOutcome};
pub use process::{ProcessedSpill, StreamProcessingTask, process_spill};
pub use registry::StreamLoaders;
