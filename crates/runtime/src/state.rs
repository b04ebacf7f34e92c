//! Word counter lifecycle.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of the word counter.
///
/// ```text
/// STARTING -> CONSUMING <-> FLUSHING
///                 |            |
///                 +--> STOPPING <+
///                         |
///                      STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Starting,
    Consuming,
    Flushing,
    Stopping,
    Stopped,
}

impl ConsumerState {
    pub fn valid_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Starting, Consuming)
                | (Starting, Stopping)
                | (Starting, Stopped)
                | (Consuming, Flushing)
                | (Consuming, Stopping)
                | (Consuming, Stopped)
                | (Flushing, Consuming)
                | (Flushing, Stopping)
                | (Flushing, Stopped)
                | (Stopping, Stopped)
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, ConsumerState::Consuming | ConsumerState::Flushing)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Starting => "STARTING",
            ConsumerState::Consuming => "CONSUMING",
            ConsumerState::Flushing => "FLUSHING",
            ConsumerState::Stopping => "STOPPING",
            ConsumerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Publishes state changes to any number of observers.
pub(crate) struct StateTracker {
    tx: watch::Sender<ConsumerState>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConsumerState::Starting);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ConsumerState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.tx.subscribe()
    }

    /// Move to `next`. An unexpected transition is logged and applied anyway.
    pub(crate) fn set(&self, next: ConsumerState) {
        let current = self.get();
        if current == next {
            return;
        }
        if current.valid_transition_to(next) {
            info!(from = %current, to = %next, "Word counter state changed");
        } else {
            warn!(from = %current, to = %next, "Unexpected word counter state transition");
        }
        self.tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConsumerState::*;

    #[test]
    fn test_transitions() {
        assert!(Starting.valid_transition_to(Consuming));
        assert!(Consuming.valid_transition_to(Flushing));
        assert!(Flushing.valid_transition_to(Consuming));
        assert!(Consuming.valid_transition_to(Stopping));
        assert!(Stopping.valid_transition_to(Stopped));

        assert!(!Stopped.valid_transition_to(Consuming));
        assert!(!Stopping.valid_transition_to(Consuming));
        assert!(!Starting.valid_transition_to(Flushing));
    }

    #[test]
    fn test_tracker_publishes_changes() {
        let tracker = StateTracker::new();
        let rx = tracker.subscribe();
        tracker.set(Consuming);
        assert_eq!(*rx.borrow(), Consuming);

        // Unexpected, but still applied.
        tracker.set(Starting);
        assert_eq!(tracker.get(), Starting);
    }
}
