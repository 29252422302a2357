use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// State persisted per stream at the destination and read back at the start of every sync.
///
/// Values are immutable. Updating a flag produces a new value through a `with_*` constructor, so
/// a state observed by one task can never change under it.
pub trait DestinationState:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Returns `true` if the final table must be rebuilt from the raw table before the next
    /// typing and deduplication pass.
    fn needs_soft_reset(&self) -> bool;

    /// Returns a copy of this state with the soft reset flag set to `needs_soft_reset`.
    fn with_soft_reset(&self, needs_soft_reset: bool) -> Self;
}

/// Smallest state satisfying [`DestinationState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimumDestinationState {
    #[serde(default)]
    needs_soft_reset: bool,
}

impl MinimumDestinationState {
    pub fn new(needs_soft_reset: bool) -> Self {
        Self { needs_soft_reset }
    }
}

impl DestinationState for MinimumDestinationState {
    fn needs_soft_reset(&self) -> bool {
        self.needs_soft_reset
    }

    fn with_soft_reset(&self, needs_soft_reset: bool) -> Self {
        Self { needs_soft_reset }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_soft_reset_returns_new_value() {
        let state = MinimumDestinationState::default();
        let reset = state.with_soft_reset(true);

        assert!(!state.needs_soft_reset());
        assert!(reset.needs_soft_reset());
        assert!(!reset.with_soft_reset(false).needs_soft_reset());
    }

    #[test]
    fn state_round_trips_through_json() {
        let state = MinimumDestinationState::new(true);
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json, serde_json::json!({ "needsSoftReset": true }));

        let parsed: MinimumDestinationState = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed, MinimumDestinationState::default());
    }
}
