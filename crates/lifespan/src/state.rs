//! Lifecycle states.
//!
//! ## State Transitions
//!
//! ```text
//! Uninitialized -> Starting   (coordinator begins startup)
//! Starting      -> Ready      (every resource verified)
//! Ready         -> Draining   (shutdown begins, no new handles)
//! Starting      -> Draining   (startup failed, unwinding)
//! Draining      -> Stopped    (pools closed)
//! ```
//!
//! A [`ResourceManager`](crate::ResourceManager) walks the same enum but
//! never enters `Starting`: `Uninitialized -> Ready -> Draining -> Stopped`.
//! States are never revisited.

use std::fmt;

/// Lifecycle state of the process or of a single resource manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// Nothing has been started yet.
    #[default]
    Uninitialized,
    /// Startup is in progress.
    Starting,
    /// Handles may be issued.
    Ready,
    /// Shutdown has begun; outstanding handles are being waited for.
    Draining,
    /// Pools are closed.
    Stopped,
}

impl LifecycleState {
    /// Whether new handles may be issued in this state.
    #[must_use]
    pub fn accepts_acquisitions(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Draining | Self::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Starting)
                | (Self::Uninitialized, Self::Ready)
                | (Self::Uninitialized, Self::Draining)
                | (Self::Starting, Self::Ready)
                | (Self::Starting, Self::Draining)
                | (Self::Ready, Self::Draining)
                | (Self::Draining, Self::Stopped)
        )
    }

    /// Lower-case name used in logs and error messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LifecycleState; 5] = [
        LifecycleState::Uninitialized,
        LifecycleState::Starting,
        LifecycleState::Ready,
        LifecycleState::Draining,
        LifecycleState::Stopped,
    ];

    #[test]
    fn test_only_ready_accepts_acquisitions() {
        for state in ALL {
            assert_eq!(state.accepts_acquisitions(), state == LifecycleState::Ready);
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        for from in ALL {
            for to in ALL {
                if from.can_transition_to(to) {
                    assert!(to > from, "{from} -> {to} goes backwards");
                }
            }
        }
    }

    #[test]
    fn test_no_state_is_revisited() {
        for state in ALL {
            assert!(!state.can_transition_to(state));
        }
        assert!(!LifecycleState::Stopped.can_transition_to(LifecycleState::Ready));
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::Draining.to_string(), "draining");
        assert_eq!(LifecycleState::default(), LifecycleState::Uninitialized);
    }
}
