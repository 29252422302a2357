//! Per-stream state carried through a sync.
//!
//! [`destination`] holds the state persisted at the destination between sync attempts,
//! [`initial`] the snapshot gathered at the start of a sync, [`checkpoint`] the accounting that
//! decides when source checkpoints can be acknowledged and [`lifecycle`] the stream lifecycle
//! observed by whoever reports sync results.

pub mod checkpoint;
pub mod destination;
pub mod initial;
pub mod lifecycle;
