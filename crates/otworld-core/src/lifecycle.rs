//! Process lifecycle state machine.
//!
//! ```text
//! NotStarted -> Bootstrapping -> Ready -> Running -> Draining -> Stopped
//!                     |            |                    ^
//!                     |            +--------------------+  (no services)
//!                     +-> Stopped                          (fatal bootstrap error)
//! ```
//!
//! The `Bootstrapping -> Ready` edge is the only place the
//! [`ReadinessLatch`] is fired.

use std::fmt;

use parking_lot::Mutex;
use tracing::info;

use crate::latch::ReadinessLatch;

/// Coarse process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Threads not yet started.
    NotStarted,
    /// Bootstrap task queued or running on the dispatcher.
    Bootstrapping,
    /// World populated, listeners not yet open.
    Ready,
    /// Accepting traffic.
    Running,
    /// Shutdown requested; scheduler and dispatcher are being joined.
    Draining,
    /// Everything joined.
    Stopped,
}

impl ProcessState {
    /// Whether `self -> next` is a legal edge.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Bootstrapping)
                | (Self::Bootstrapping, Self::Ready | Self::Stopped)
                | (Self::Ready, Self::Running | Self::Draining)
                | (Self::Running, Self::Draining)
                | (Self::Draining, Self::Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The requested edge does not exist in the state machine.
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        /// State at the time of the request.
        from: ProcessState,
        /// Requested state.
        to: ProcessState,
    },
}

/// Thread-safe lifecycle tracker owning the readiness latch.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ProcessState>,
    readiness: ReadinessLatch,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a tracker in [`ProcessState::NotStarted`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::NotStarted),
            readiness: ReadinessLatch::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// The readiness latch opened by the `Bootstrapping -> Ready` edge.
    pub const fn readiness(&self) -> &ReadinessLatch {
        &self.readiness
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if the edge is not in
    /// the state machine; the state is left unchanged.
    pub fn transition(&self, next: ProcessState) -> Result<ProcessState, LifecycleError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition { from, to: next });
        }
        *state = next;
        if next == ProcessState::Ready {
            self.readiness.fire();
        }
        drop(state);

        info!(from = %from, to = %next, "lifecycle transition");
        Ok(from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_fires_latch_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ProcessState::NotStarted);

        lifecycle.transition(ProcessState::Bootstrapping).unwrap();
        assert!(!lifecycle.readiness().is_ready());
        lifecycle.transition(ProcessState::Ready).unwrap();
        assert!(lifecycle.readiness().is_ready());
        lifecycle.transition(ProcessState::Running).unwrap();
        lifecycle.transition(ProcessState::Draining).unwrap();
        let prev = lifecycle.transition(ProcessState::Stopped).unwrap();

        assert_eq!(prev, ProcessState::Draining);
        assert_eq!(lifecycle.state(), ProcessState::Stopped);
    }

    #[test]
    fn failed_bootstrap_never_opens_latch() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(ProcessState::Bootstrapping).unwrap();
        lifecycle.transition(ProcessState::Stopped).unwrap();
        assert!(!lifecycle.readiness().is_ready());
        assert!(lifecycle.transition(ProcessState::Ready).is_err());
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.transition(ProcessState::Running).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid lifecycle transition NOT_STARTED -> RUNNING"
        );
        assert_eq!(lifecycle.state(), ProcessState::NotStarted);

        lifecycle.transition(ProcessState::Bootstrapping).unwrap();
        lifecycle.transition(ProcessState::Ready).unwrap();
        assert!(lifecycle.transition(ProcessState::Ready).is_err());
        assert!(lifecycle.transition(ProcessState::Bootstrapping).is_err());
    }

    #[test]
    fn ready_may_drain_without_running() {
        assert!(ProcessState::Ready.can_transition_to(ProcessState::Draining));
        assert!(!ProcessState::Stopped.can_transition_to(ProcessState::NotStarted));
    }
}
