use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::StreamId;

/// Paces mid-sync typing passes per stream.
///
/// A stream is ready for a typing pass when the configured interval elapsed since its last pass,
/// or since it was added. Without an interval no stream is ever ready.
#[derive(Debug)]
pub struct TypingValve {
    interval: Option<Duration>,
    last_typed: HashMap<StreamId, Instant>,
}

impl TypingValve {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_typed: HashMap::new(),
        }
    }

    pub fn add_stream(&mut self, stream_id: &StreamId) {
        self.last_typed.insert(stream_id.clone(), Instant::now());
    }

    pub fn ready(&self, stream_id: &StreamId) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };

        self.last_typed
            .get(stream_id)
            .is_some_and(|last| last.elapsed() >= interval)
    }

    pub fn mark_typed(&mut self, stream_id: &StreamId) {
        self.last_typed.insert(stream_id.clone(), Instant::now());
    }
}
