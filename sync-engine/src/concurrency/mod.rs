//! Concurrency utilities for coordinating a sync.
//!
//! The [`shutdown`] module implements the broadcast-based cancellation used by the pipeline, the
//! task manager and every suspension point of the engine (waiting for a stream loader, waiting for
//! a raw table lock).

pub mod shutdown;
