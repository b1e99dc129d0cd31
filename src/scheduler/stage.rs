use std::fmt;
use std::str::FromStr;

use crate::prp::PrpState;

/// One step of the pipeline, owning a queue and its inflight list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pm,
    Validation,
    Integration,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pm, Stage::Validation, Stage::Integration];

    /// Role name used for history keys and completion fields.
    pub fn role(&self) -> &'static str {
        match self {
            Stage::Pm => "pm",
            Stage::Validation => "validator",
            Stage::Integration => "integration",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Stage::Pm => "pm_queue",
            Stage::Validation => "validation_queue",
            Stage::Integration => "integration_queue",
        }
    }

    /// State a PRP is in while this stage works on it.
    pub fn working_state(&self) -> PrpState {
        match self {
            Stage::Pm => PrpState::Dev,
            Stage::Validation => PrpState::Validation,
            Stage::Integration => PrpState::Integration,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Pm => Some(Stage::Validation),
            Stage::Validation => Some(Stage::Integration),
            Stage::Integration => None,
        }
    }

    /// State written when this stage completes.
    pub fn next_state(&self) -> PrpState {
        self.next()
            .map(|next| next.working_state())
            .unwrap_or(PrpState::Complete)
    }

    pub fn next_queue(&self) -> Option<&'static str> {
        self.next().map(|next| next.queue())
    }

    /// Stage whose queue is named `queue`.
    pub fn from_queue(queue: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.queue() == queue)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pm" | "dev" => Ok(Stage::Pm),
            "validator" | "validation" => Ok(Stage::Validation),
            "integration" => Ok(Stage::Integration),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain() {
        assert_eq!(Stage::Pm.next_queue(), Some("validation_queue"));
        assert_eq!(Stage::Pm.next_state(), PrpState::Validation);
        assert_eq!(Stage::Validation.next_queue(), Some("integration_queue"));
        assert_eq!(Stage::Validation.next_state(), PrpState::Integration);
        assert_eq!(Stage::Integration.next_queue(), None);
        assert_eq!(Stage::Integration.next_state(), PrpState::Complete);
    }

    #[test]
    fn test_working_states() {
        assert_eq!(Stage::Pm.working_state(), PrpState::Dev);
        assert_eq!(Stage::Validation.working_state(), PrpState::Validation);
        assert_eq!(Stage::Integration.working_state(), PrpState::Integration);
    }

    #[test]
    fn test_from_queue_and_str() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_queue(stage.queue()), Some(stage));
            assert_eq!(stage.role().parse::<Stage>(), Ok(stage));
        }
        assert_eq!(Stage::from_queue("qa_queue"), None);
        assert!("deploy".parse::<Stage>().is_err());
    }
}
