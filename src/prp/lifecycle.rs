use std::collections::HashMap;

use super::{PrpError, PrpState};

/// Legal PRP state transitions.
///
/// The queue scripts are the only writers of `state`; this table is what
/// they implement, and what tests and the CLI check against.
pub struct Lifecycle {
    valid_transitions: HashMap<PrpState, Vec<PrpState>>,
}

impl Lifecycle {
    /// Valid transitions:
    /// - New -> Dev (claimed by the PM stage)
    /// - Dev -> Validation, Validation -> Integration, Integration -> Complete
    /// - any non-terminal state -> itself (retry) or Failed
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(PrpState::New, vec![PrpState::Dev, PrpState::Failed]);
        valid_transitions.insert(
            PrpState::Dev,
            vec![PrpState::Dev, PrpState::Validation, PrpState::Failed],
        );
        valid_transitions.insert(
            PrpState::Validation,
            vec![
                PrpState::Validation,
                PrpState::Integration,
                PrpState::Failed,
            ],
        );
        valid_transitions.insert(
            PrpState::Integration,
            vec![
                PrpState::Integration,
                PrpState::Complete,
                PrpState::Failed,
            ],
        );
        valid_transitions.insert(PrpState::Complete, vec![]);
        valid_transitions.insert(PrpState::Failed, vec![]);

        Self { valid_transitions }
    }

    /// Check if a transition between two states is allowed.
    pub fn can_transition(&self, from: PrpState, to: PrpState) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Like [`can_transition`](Self::can_transition) but as a `Result`.
    pub fn check(&self, from: PrpState, to: PrpState) -> Result<(), PrpError> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(PrpError::IllegalTransition { from, to })
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
