//! Utilities for testing the sync engine against in-memory destinations.
//!
//! - [`catalog`] builds test streams, catalogs and messages.
//! - [`storage`] wraps a destination to record calls and inject failures.
//! - [`pipeline`] assembles pipelines over a wrapped [`crate::destination::memory::MemoryDestination`].
//! - [`notify`] provides notifications that time out instead of hanging a test.

pub mod catalog;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod notify;
pub mod pipeline;
pub mod storage;
