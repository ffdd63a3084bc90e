//! Per-operation apply lifecycle.
//!
//! Create, update and replace operations move `Pending -> Planned -> Applying`
//! and end `Applied` or `Failed`. Destroys move through `Destroying` and end
//! `Destroyed` or `Failed`. Operations that never start end `Cancelled`
//! (session cancelled) or `Skipped` (a prerequisite failed).

use serde::Serialize;
use thiserror::Error;

use super::plan::OperationKind;

/// State of one operation during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationState {
    /// Not yet part of a plan.
    Pending,
    /// Planned and waiting for its prerequisites.
    Planned,
    /// Create, update or replace in flight.
    Applying,
    /// Applied successfully.
    Applied,
    /// Destroy in flight.
    Destroying,
    /// Destroyed successfully.
    Destroyed,
    /// Provider reported an error or the operation timed out.
    Failed,
    /// Never dispatched because the session was cancelled.
    Cancelled,
    /// Never dispatched because a prerequisite did not succeed.
    Skipped,
}

/// Input to the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The operation was added to a plan.
    Plan,
    /// All prerequisites succeeded and a worker picked it up.
    Dispatch,
    /// The provider finished successfully.
    Succeed,
    /// The provider failed or the timeout elapsed.
    Fail,
    /// The session was cancelled before dispatch.
    Cancel,
    /// A prerequisite failed before dispatch.
    Skip,
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from:?} on {event:?}")]
pub struct TransitionError {
    /// State the operation was in.
    pub from: OperationState,
    /// Event that was rejected.
    pub event: LifecycleEvent,
}

impl OperationState {
    /// Applies an event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the event is not valid in this state.
    pub const fn transition(self, event: LifecycleEvent, kind: OperationKind) -> Result<Self, TransitionError> {
        use LifecycleEvent as E;

        let destroy = matches!(kind, OperationKind::Destroy);
        match (self, event) {
            (Self::Pending, E::Plan) => Ok(Self::Planned),
            (Self::Planned, E::Dispatch) if destroy => Ok(Self::Destroying),
            (Self::Planned, E::Dispatch) => Ok(Self::Applying),
            (Self::Planned, E::Cancel) => Ok(Self::Cancelled),
            (Self::Planned, E::Skip) => Ok(Self::Skipped),
            (Self::Applying, E::Succeed) => Ok(Self::Applied),
            (Self::Destroying, E::Succeed) => Ok(Self::Destroyed),
            (Self::Applying | Self::Destroying, E::Fail) => Ok(Self::Failed),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Destroyed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns true if the operation reached terminal success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::Destroyed)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: OperationKind, events: &[LifecycleEvent]) -> Result<OperationState, TransitionError> {
        events
            .iter()
            .try_fold(OperationState::Pending, |state, &event| state.transition(event, kind))
    }

    #[test]
    fn test_apply_path() {
        use LifecycleEvent::*;
        let state = run(OperationKind::Create, &[Plan, Dispatch, Succeed]).unwrap();
        assert_eq!(state, OperationState::Applied);
        assert!(state.is_success());
    }

    #[test]
    fn test_destroy_path() {
        use LifecycleEvent::*;
        assert_eq!(
            run(OperationKind::Destroy, &[Plan, Dispatch]).unwrap(),
            OperationState::Destroying
        );
        assert_eq!(
            run(OperationKind::Destroy, &[Plan, Dispatch, Succeed]).unwrap(),
            OperationState::Destroyed
        );
        assert_eq!(
            run(OperationKind::Destroy, &[Plan, Dispatch, Fail]).unwrap(),
            OperationState::Failed
        );
    }

    #[test]
    fn test_not_started_outcomes() {
        use LifecycleEvent::*;
        assert_eq!(run(OperationKind::Update, &[Plan, Cancel]).unwrap(), OperationState::Cancelled);
        assert_eq!(run(OperationKind::Update, &[Plan, Skip]).unwrap(), OperationState::Skipped);
        assert!(OperationState::Cancelled.is_terminal());
        assert!(!OperationState::Cancelled.is_success());
    }

    #[test]
    fn test_invalid_transitions() {
        use LifecycleEvent::*;
        let err = run(OperationKind::Create, &[Plan, Dispatch, Cancel]).unwrap_err();
        assert_eq!(err.from, OperationState::Applying);
        assert!(run(OperationKind::Create, &[Dispatch]).is_err());
        assert!(run(OperationKind::Create, &[Plan, Dispatch, Succeed, Fail]).is_err());
    }
}
