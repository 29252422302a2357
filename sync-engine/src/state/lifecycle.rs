use std::fmt;

use crate::error::SyncError;

/// Lifecycle of a stream within one sync.
///
/// `Registered -> Loading -> Committing -> Complete`, with `Failed` reachable from every
/// non-terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLifecycle {
    /// The stream is in the catalog, its loader is not ready yet.
    Registered,
    /// The loader is ready and batches are being staged.
    Loading,
    /// The stream was closed and waits for its final table to be committed.
    Committing,
    /// The final table was committed.
    Complete,
    /// The stream failed, carrying the error that caused it.
    Failed(SyncError),
}

impl StreamLifecycle {
    pub fn as_type(&self) -> StreamLifecycleType {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamLifecycle::Complete | StreamLifecycle::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StreamLifecycle::Failed(_))
    }

    /// Returns `true` if a stream in this state may move to `next`.
    pub fn can_transition_to(&self, next: StreamLifecycleType) -> bool {
        use StreamLifecycleType::*;

        matches!(
            (self.as_type(), next),
            (Registered, Loading)
                | (Loading, Committing)
                | (Committing, Complete)
                | (Registered | Loading | Committing, Failed)
        )
    }
}

/// Discriminant of [`StreamLifecycle`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamLifecycleType {
    Registered,
    Loading,
    Committing,
    Complete,
    Failed,
}

impl<'a> From<&'a StreamLifecycle> for StreamLifecycleType {
    fn from(lifecycle: &'a StreamLifecycle) -> Self {
        match lifecycle {
            StreamLifecycle::Registered => Self::Registered,
            StreamLifecycle::Loading => Self::Loading,
            StreamLifecycle::Committing => Self::Committing,
            StreamLifecycle::Complete => Self::Complete,
            StreamLifecycle::Failed(_) => Self::Failed,
        }
    }
}

impl fmt::Display for StreamLifecycleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Loading => write!(f, "loading"),
            Self::Committing => write!(f, "committing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
