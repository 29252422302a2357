//! Local spill storage for incoming records.
//!
//! The [`RecordSpooler`] appends records of every stream to a per-stream spill file and turns the
//! file into a [`crate::types::Batch`] when a size or count threshold is reached. Spill files are
//! JSON lines, read back lazily through [`SpooledRecords`].

mod file;
mod spooler;

pub use file::{SpillFile, SpooledEntry, SpooledRecords};
pub use spooler::RecordSpooler;
