//! Passphrase setup state machine
//!
//! `Intro -> Create -> Confirm -> Final -> Committed`. Transitions are pure:
//! [`SetupState::apply`] consumes the state and returns the next one along
//! with the reason a request was refused, if it was. The UI renders the
//! current state and dispatches [`SetupEvent`]s; it never holds the
//! candidate passphrase itself.

use crate::error::Error;
use crate::session::PassphrasePolicy;
use std::fmt;
use zeroize::Zeroizing;

/// Setup stage
pub enum SetupState {
    /// Explanation screen, nothing entered yet
    Intro,
    /// Waiting for a candidate passphrase
    Create,
    /// Candidate accepted by the policy, waiting for confirmation
    Confirm { candidate: Zeroizing<String> },
    /// Confirmation matched, waiting for the unrecoverability acknowledgement
    Final { passphrase: Zeroizing<String> },
    /// Accepted; the passphrase can be taken with [`SetupState::into_passphrase`]
    Committed { passphrase: Zeroizing<String> },
}

/// Requests the UI can dispatch
pub enum SetupEvent {
    Start,
    Propose(Zeroizing<String>),
    Confirm(Zeroizing<String>),
    /// `true` only when the user explicitly accepted that a lost passphrase
    /// cannot be recovered
    Acknowledge(bool),
    /// Return from `Confirm` to `Create`, discarding the candidate
    Back,
    Cancel,
}

impl SetupEvent {
    pub fn propose(candidate: impl Into<String>) -> Self {
        SetupEvent::Propose(Zeroizing::new(candidate.into()))
    }

    pub fn confirm(confirmation: impl Into<String>) -> Self {
        SetupEvent::Confirm(Zeroizing::new(confirmation.into()))
    }
}

/// Result of applying an event
pub struct Transition {
    pub state: SetupState,
    /// Why the request was refused; `None` when it was accepted
    pub rejection: Option<Error>,
}

impl Transition {
    fn accepted(state: SetupState) -> Self {
        Transition {
            state,
            rejection: None,
        }
    }

    fn rejected(state: SetupState, error: Error) -> Self {
        Transition {
            state,
            rejection: Some(error),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

impl SetupState {
    pub fn new() -> Self {
        SetupState::Intro
    }

    /// Stage name, safe to show or log
    pub fn stage(&self) -> &'static str {
        match self {
            SetupState::Intro => "intro",
            SetupState::Create => "create",
            SetupState::Confirm { .. } => "confirm",
            SetupState::Final { .. } => "final",
            SetupState::Committed { .. } => "committed",
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, SetupState::Committed { .. })
    }

    /// Apply an event
    pub fn apply(self, event: SetupEvent, policy: &dyn PassphrasePolicy) -> Transition {
        match (self, event) {
            // Cancel clears every candidate value from any stage
            (_, SetupEvent::Cancel) => Transition::accepted(SetupState::Intro),

            (SetupState::Intro, SetupEvent::Start) => Transition::accepted(SetupState::Create),

            (SetupState::Create, SetupEvent::Propose(candidate)) => {
                let violations = policy.violations(&candidate);
                if violations.is_empty() {
                    Transition::accepted(SetupState::Confirm { candidate })
                } else {
                    Transition::rejected(SetupState::Create, Error::WeakPassphrase(violations))
                }
            }

            (SetupState::Confirm { candidate }, SetupEvent::Confirm(confirmation)) => {
                if candidate.as_bytes() == confirmation.as_bytes() {
                    Transition::accepted(SetupState::Final {
                        passphrase: candidate,
                    })
                } else {
                    Transition::rejected(SetupState::Confirm { candidate }, Error::PassphraseMismatch)
                }
            }

            (SetupState::Confirm { .. }, SetupEvent::Back) => {
                Transition::accepted(SetupState::Create)
            }

            (SetupState::Final { passphrase }, SetupEvent::Acknowledge(true)) => {
                Transition::accepted(SetupState::Committed { passphrase })
            }

            (SetupState::Final { passphrase }, SetupEvent::Acknowledge(false)) => {
                Transition::rejected(SetupState::Final { passphrase }, Error::AcknowledgementRequired)
            }

            (state, event) => {
                let message = format!("{} not allowed in stage {}", event.name(), state.stage());
                Transition::rejected(state, Error::InvalidTransition(message))
            }
        }
    }

    /// Take the accepted passphrase out of a committed state
    pub fn into_passphrase(self) -> Option<Zeroizing<String>> {
        match self {
            SetupState::Committed { passphrase } => Some(passphrase),
            _ => None,
        }
    }
}

impl Default for SetupState {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupEvent {
    fn name(&self) -> &'static str {
        match self {
            SetupEvent::Start => "start",
            SetupEvent::Propose(_) => "propose",
            SetupEvent::Confirm(_) => "confirm",
            SetupEvent::Acknowledge(_) => "acknowledge",
            SetupEvent::Back => "back",
            SetupEvent::Cancel => "cancel",
        }
    }
}

impl fmt::Debug for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SetupState({})", self.stage())
    }
}

impl fmt::Debug for SetupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SetupEvent({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StrengthPolicy;

    const GOOD: &str = "Correct-Horse-42";

    fn drive(events: Vec<SetupEvent>) -> Transition {
        let policy = StrengthPolicy::default();
        let mut transition = Transition::accepted(SetupState::new());
        for event in events {
            transition = transition.state.apply(event, &policy);
        }
        transition
    }

    #[test]
    fn test_happy_path_commits() {
        let t = drive(vec![
            SetupEvent::Start,
            SetupEvent::propose(GOOD),
            SetupEvent::confirm(GOOD),
            SetupEvent::Acknowledge(true),
        ]);
        assert!(t.is_accepted());
        assert!(t.state.is_committed());
        assert_eq!(t.state.into_passphrase().unwrap().as_str(), GOOD);
    }

    #[test]
    fn test_weak_candidate_stays_in_create() {
        let t = drive(vec![SetupEvent::Start, SetupEvent::propose("abc")]);
        assert_eq!(t.state.stage(), "create");
        assert!(matches!(t.rejection, Some(Error::WeakPassphrase(_))));
    }

    #[test]
    fn test_mismatch_stays_in_confirm_without_revealing() {
        let t = drive(vec![
            SetupEvent::Start,
            SetupEvent::propose(GOOD),
            SetupEvent::confirm("Correct-Horse-43"),
        ]);
        assert_eq!(t.state.stage(), "confirm");
        let err = t.rejection.unwrap();
        assert!(matches!(err, Error::PassphraseMismatch));
        assert!(!err.to_string().contains(GOOD));
        assert!(!format!("{:?}", t.state).contains(GOOD));

        // A correct retry still succeeds from the retained candidate
        let t = t
            .state
            .apply(SetupEvent::confirm(GOOD), &StrengthPolicy::default());
        assert_eq!(t.state.stage(), "final");
    }

    #[test]
    fn test_confirmation_is_exact() {
        let t = drive(vec![
            SetupEvent::Start,
            SetupEvent::propose(GOOD),
            SetupEvent::confirm(format!("{} ", GOOD)),
        ]);
        assert!(matches!(t.rejection, Some(Error::PassphraseMismatch)));
    }

    #[test]
    fn test_commit_requires_acknowledgement() {
        let t = drive(vec![
            SetupEvent::Start,
            SetupEvent::propose(GOOD),
            SetupEvent::confirm(GOOD),
            SetupEvent::Acknowledge(false),
        ]);
        assert_eq!(t.state.stage(), "final");
        assert!(matches!(t.rejection, Some(Error::AcknowledgementRequired)));
        assert!(t.state.into_passphrase().is_none());
    }

    #[test]
    fn test_cancel_clears_from_any_stage() {
        let t = drive(vec![
            SetupEvent::Start,
            SetupEvent::propose(GOOD),
            SetupEvent::confirm(GOOD),
            SetupEvent::Cancel,
        ]);
        assert!(t.is_accepted());
        assert_eq!(t.state.stage(), "intro");
    }

    #[test]
    fn test_back_discards_candidate() {
        let t = drive(vec![SetupEvent::Start, SetupEvent::propose(GOOD), SetupEvent::Back]);
        assert_eq!(t.state.stage(), "create");
    }

    #[test]
    fn test_out_of_order_event_rejected() {
        let t = drive(vec![SetupEvent::confirm(GOOD)]);
        assert_eq!(t.state.stage(), "intro");
        assert!(matches!(t.rejection, Some(Error::InvalidTransition(_))));
    }
}
