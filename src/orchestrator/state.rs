//! Answer state machine
//!
//! `Retrieving → Prompting → Validating → {Executing | Reprompting} → Done | Failed`.
//! Every transition is logged and kept in the trace returned with the answer.

use crate::error::ErrorKind;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnswerState {
    Retrieving,
    Prompting { attempt: u32 },
    Validating { attempt: u32 },
    Reprompting { attempt: u32, reason: ErrorKind },
    Executing { retry: u32 },
    Done,
    Failed { kind: ErrorKind },
}

impl AnswerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnswerState::Done | AnswerState::Failed { .. })
    }

    fn can_follow(&self, previous: Option<&AnswerState>) -> bool {
        use AnswerState::*;
        match (previous, self) {
            (_, Failed { .. }) => !previous.map_or(false, AnswerState::is_terminal),
            (None, Retrieving) => true,
            (Some(Retrieving), Prompting { attempt: 1 }) => true,
            (Some(Prompting { attempt: a }), Validating { attempt: b }) => a == b,
            (Some(Validating { attempt: a }), Reprompting { attempt: b, .. }) => a == b,
            (Some(Reprompting { attempt: a, .. }), Prompting { attempt: b }) => *b == a + 1,
            (Some(Validating { .. }), Executing { retry: 0 }) => true,
            (Some(Executing { retry: a }), Executing { retry: b }) => *b == a + 1,
            (Some(Executing { .. }), Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AnswerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerState::Retrieving => write!(f, "Retrieving"),
            AnswerState::Prompting { attempt } => write!(f, "Prompting(attempt {})", attempt),
            AnswerState::Validating { attempt } => write!(f, "Validating(attempt {})", attempt),
            AnswerState::Reprompting { attempt, reason } => write!(f, "Reprompting(after attempt {}: {})", attempt, reason),
            AnswerState::Executing { retry } => write!(f, "Executing(retry {})", retry),
            AnswerState::Done => write!(f, "Done"),
            AnswerState::Failed { kind } => write!(f, "Failed({})", kind),
        }
    }
}

/// Ordered record of the states one question went through.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateTrace {
    states: Vec<AnswerState>,
}

impl StateTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, state: AnswerState) {
        // Transitions are driven by the orchestrator alone; an illegal one is a bug.
        debug_assert!(
            state.can_follow(self.states.last()),
            "illegal transition {:?} -> {}",
            self.states.last(),
            state
        );
        debug!("State -> {}", state);
        self.states.push(state);
    }

    pub fn current(&self) -> Option<&AnswerState> {
        self.states.last()
    }

    pub fn states(&self) -> &[AnswerState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<AnswerState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_reprompt() {
        let mut trace = StateTrace::new();
        trace.enter(AnswerState::Retrieving);
        trace.enter(AnswerState::Prompting { attempt: 1 });
        trace.enter(AnswerState::Validating { attempt: 1 });
        trace.enter(AnswerState::Reprompting { attempt: 1, reason: ErrorKind::NotSelect });
        trace.enter(AnswerState::Prompting { attempt: 2 });
        trace.enter(AnswerState::Validating { attempt: 2 });
        trace.enter(AnswerState::Executing { retry: 0 });
        trace.enter(AnswerState::Executing { retry: 1 });
        trace.enter(AnswerState::Done);
        assert_eq!(trace.states().len(), 9);
        assert!(trace.current().unwrap().is_terminal());
    }

    #[test]
    fn test_transition_rules() {
        assert!(AnswerState::Retrieving.can_follow(None));
        assert!(!AnswerState::Done.can_follow(Some(&AnswerState::Validating { attempt: 1 })));
        assert!(!AnswerState::Prompting { attempt: 3 }.can_follow(Some(&AnswerState::Reprompting {
            attempt: 1,
            reason: ErrorKind::BlockedKeyword,
        })));
        assert!(AnswerState::Failed { kind: ErrorKind::ModelTimeout }.can_follow(Some(&AnswerState::Prompting { attempt: 1 })));
        assert!(!AnswerState::Failed { kind: ErrorKind::ModelTimeout }.can_follow(Some(&AnswerState::Done)));
    }

    #[test]
    fn test_display() {
        assert_eq!(AnswerState::Failed { kind: ErrorKind::UnsafeQuery }.to_string(), "Failed(UnsafeQuery)");
    }
}
