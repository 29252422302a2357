//! Typing and deduplication of staged records into final tables.

mod base;
mod default;
mod lock;
mod noop;
mod valve;

pub use base::{PreparedStream, StreamFailures, TyperDeduper, TypingPhase};
pub use default::DefaultTyperDeduper;
pub use lock::{LockCondition, RawTableGuard, RawTableLock};
pub use noop::NoOpTyperDeduper;
pub use valve::TypingValve;
