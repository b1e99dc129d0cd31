//! Completion criteria: predicates over a PRP's evidence.

use std::fmt;

use crate::config::AgentProfile;
use crate::evidence::Evidence;
use crate::scheduler::Stage;

/// One condition a stage must satisfy before it can be promoted.
#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    /// The field must be truthy (see [`Evidence::flag`]).
    Flag(String),
    /// The field must be a number at least this large.
    AtLeast(String, f64),
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Flag(key) | Requirement::AtLeast(key, _) => key,
        }
    }

    pub fn is_met(&self, evidence: &Evidence) -> bool {
        match self {
            Requirement::Flag(key) => evidence.flag(key),
            Requirement::AtLeast(key, min) => evidence.number(key).is_some_and(|n| n >= *min),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Flag(key) => write!(f, "{}", key),
            Requirement::AtLeast(key, min) => write!(f, "{} >= {}", key, min),
        }
    }
}

/// All requirements of one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionCriteria {
    requirements: Vec<Requirement>,
}

impl CompletionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flag requirement.
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Flag(key.into()));
        self
    }

    /// Add a numeric minimum.
    pub fn at_least(mut self, key: impl Into<String>, min: f64) -> Self {
        self.requirements.push(Requirement::AtLeast(key.into(), min));
        self
    }

    /// Criteria enforced by `stage` under `profile`.
    pub fn for_stage(stage: Stage, profile: AgentProfile, min_coverage_pct: f64) -> Self {
        let base = match stage {
            Stage::Pm => Self::new()
                .flag("tests_passed")
                .at_least("coverage_pct", min_coverage_pct),
            Stage::Validation => Self::new().flag("validation_passed"),
            Stage::Integration => Self::new().flag("ci_passed").flag("deployed"),
        };
        match (profile, stage) {
            (AgentProfile::Standard, _) => base,
            (AgentProfile::Strict, Stage::Pm) => base.flag("lint_passed"),
            (AgentProfile::Strict, Stage::Validation) => base.flag("security_review_passed"),
            (AgentProfile::Strict, Stage::Integration) => base.flag("smoke_test_passed"),
        }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Requirements `evidence` does not satisfy, in declaration order.
    pub fn unmet<'a>(&'a self, evidence: &Evidence) -> Vec<&'a Requirement> {
        self.requirements
            .iter()
            .filter(|req| !req.is_met(evidence))
            .collect()
    }

    pub fn is_met(&self, evidence: &Evidence) -> bool {
        self.unmet(evidence).is_empty()
    }

    /// The evidence keys an agent is asked to report.
    pub fn keys(&self) -> Vec<&str> {
        self.requirements.iter().map(Requirement::key).collect()
    }
}

/// `a, b >= 80` rendering of a list of requirements.
pub fn describe(requirements: &[&Requirement]) -> String {
    requirements
        .iter()
        .map(|req| req.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
