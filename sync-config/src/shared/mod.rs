//! Shared configuration types for destination syncs.

mod base;
mod spool;
mod sync;
mod typing;

pub use base::ValidationError;
pub use spool::SpoolConfig;
pub use sync::SyncConfig;
pub use typing::TypingConfig;
