//! Service lifecycle state machine.
//!
//! ```text
//!            start           passivate
//! AVAILABLE -------> RUNNING ---------> PASSIVATED
//!                     |   ^  activate      |
//!                     |   +----------------+
//!                stop |                    | stop
//!                     v                    v
//!                  STOPPED <---------------+
//! ```
//!
//! `STOPPED` is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Registered, not yet started. Initial state.
    Available,
    /// Actively producing and consuming records.
    Running,
    /// Suspended: keeps internal state and channel bindings, does not process.
    Passivated,
    /// Terminal: channels destroyed, resources released.
    Stopped,
}

impl ServiceState {
    /// Applies a transition, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if `transition` is not legal from `self`.
    pub fn apply(self, transition: Transition) -> Result<ServiceState, IllegalTransition> {
        use ServiceState::{Available, Passivated, Running, Stopped};
        use Transition::{Activate, Passivate, Start, Stop};

        match (self, transition) {
            (Available, Start) | (Passivated, Activate) => Ok(Running),
            (Running, Passivate) => Ok(Passivated),
            (Running | Passivated, Stop) => Ok(Stopped),
            _ => Err(IllegalTransition {
                current: self,
                attempted: transition.target(),
            }),
        }
    }

    /// Finds the transition that moves `self` to `target`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if no single legal transition reaches `target`.
    pub fn transition_to(self, target: ServiceState) -> Result<Transition, IllegalTransition> {
        let candidate = match target {
            ServiceState::Running if self == ServiceState::Passivated => Transition::Activate,
            ServiceState::Running => Transition::Start,
            ServiceState::Passivated => Transition::Passivate,
            ServiceState::Stopped => Transition::Stop,
            ServiceState::Available => {
                return Err(IllegalTransition {
                    current: self,
                    attempted: target,
                })
            }
        };
        self.apply(candidate).map(|_| candidate)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ServiceState::Stopped
    }

    /// Whether the service holds channel bindings (running or suspended).
    #[must_use]
    pub fn holds_bindings(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Passivated)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::Available => "AVAILABLE",
            ServiceState::Running => "RUNNING",
            ServiceState::Passivated => "PASSIVATED",
            ServiceState::Stopped => "STOPPED",
        })
    }
}

/// A lifecycle transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Start,
    Passivate,
    Activate,
    Stop,
}

impl Transition {
    /// The state this transition leads to when legal.
    #[must_use]
    pub fn target(self) -> ServiceState {
        match self {
            Transition::Start | Transition::Activate => ServiceState::Running,
            Transition::Passivate => ServiceState::Passivated,
            Transition::Stop => ServiceState::Stopped,
        }
    }
}

/// Rejected transition, naming the attempted target and the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move from {current} to {attempted}")]
pub struct IllegalTransition {
    pub current: ServiceState,
    pub attempted: ServiceState,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL_STATES: [ServiceState; 4] = [
        ServiceState::Available,
        ServiceState::Running,
        ServiceState::Passivated,
        ServiceState::Stopped,
    ];

    const ALL_TRANSITIONS: [Transition; 4] = [
        Transition::Start,
        Transition::Passivate,
        Transition::Activate,
        Transition::Stop,
    ];

    #[test]
    fn legal_transitions() {
        assert_eq!(
            ServiceState::Available.apply(Transition::Start),
            Ok(ServiceState::Running)
        );
        assert_eq!(
            ServiceState::Running.apply(Transition::Passivate),
            Ok(ServiceState::Passivated)
        );
        assert_eq!(
            ServiceState::Passivated.apply(Transition::Activate),
            Ok(ServiceState::Running)
        );
        assert_eq!(
            ServiceState::Running.apply(Transition::Stop),
            Ok(ServiceState::Stopped)
        );
        assert_eq!(
            ServiceState::Passivated.apply(Transition::Stop),
            Ok(ServiceState::Stopped)
        );
    }

    #[test]
    fn start_twice_names_both_states() {
        let err = ServiceState::Running.apply(Transition::Start).unwrap_err();
        assert_eq!(err.current, ServiceState::Running);
        assert_eq!(err.attempted, ServiceState::Running);
    }

    #[test]
    fn available_cannot_stop() {
        let err = ServiceState::Available.apply(Transition::Stop).unwrap_err();
        assert_eq!(err.current, ServiceState::Available);
        assert_eq!(err.attempted, ServiceState::Stopped);
    }

    #[test]
    fn transition_to_picks_activate_from_passivated() {
        assert_eq!(
            ServiceState::Passivated.transition_to(ServiceState::Running),
            Ok(Transition::Activate)
        );
        assert_eq!(
            ServiceState::Available.transition_to(ServiceState::Running),
            Ok(Transition::Start)
        );
        assert!(ServiceState::Running
            .transition_to(ServiceState::Available)
            .is_err());
    }

    #[test]
    fn display_uses_upper_case() {
        assert_eq!(ServiceState::Passivated.to_string(), "PASSIVATED");
    }

    fn any_state() -> impl Strategy<Value = ServiceState> {
        proptest::sample::select(ALL_STATES.to_vec())
    }

    fn any_transition() -> impl Strategy<Value = Transition> {
        proptest::sample::select(ALL_TRANSITIONS.to_vec())
    }

    proptest! {
        #[test]
        fn stopped_is_terminal(t in any_transition()) {
            prop_assert!(ServiceState::Stopped.apply(t).is_err());
        }

        #[test]
        fn successful_transition_reaches_its_target(s in any_state(), t in any_transition()) {
            if let Ok(next) = s.apply(t) {
                prop_assert_eq!(next, t.target());
            }
        }

        #[test]
        fn failed_transition_reports_current_state(s in any_state(), t in any_transition()) {
            if let Err(err) = s.apply(t) {
                prop_assert_eq!(err.current, s);
                prop_assert_eq!(err.attempted, t.target());
            }
        }

        #[test]
        fn no_transition_returns_to_available(s in any_state(), t in any_transition()) {
            prop_assert_ne!(s.apply(t).ok(), Some(ServiceState::Available));
        }

        #[test]
        fn random_walk_never_leaves_stopped(path in proptest::collection::vec(any_transition(), 0..32)) {
            let mut state = ServiceState::Available;
            let mut stopped = false;
            for t in path {
                if let Ok(next) = state.apply(t) {
                    prop_assert!(!stopped);
                    state = next;
                }
                stopped |= state.is_terminal();
            }
        }
    }
}
