//! PM agent: turns a PRP into an implementation with passing tests.

use super::criteria::CompletionCriteria;
use super::role::{render_prior_evidence, render_prp_header, reporting_instructions, RoleAgent};
use crate::config::AgentProfile;
use crate::prp::Prp;
use crate::scheduler::Stage;

/// System prompt for the implementation stage.
const PM_SYSTEM_PROMPT: &str = r#"You are the PM agent of an autonomous delivery pipeline.

You receive a Product Requirement Prompt (PRP) and own it until it is implemented:
1. Restate the requirement and its acceptance criteria.
2. Plan the change as small, reviewable steps.
3. Implement the change together with tests.
4. Run the test suite and measure coverage.

Be concrete. Name files, functions and commands. Report the real outcome of every command you ran."#;

const PM_STRICT_ADDENDUM: &str = r#"Additional requirements for this pipeline:
- Run the project's linters and formatters; report "lint_passed".
- Keep public interfaces backwards compatible unless the PRP says otherwise."#;

/// Implementation stage agent.
pub struct PmAgent {
    profile: AgentProfile,
    criteria: CompletionCriteria,
}

impl PmAgent {
    pub fn new(profile: AgentProfile, min_coverage_pct: f64) -> Self {
        Self {
            profile,
            criteria: CompletionCriteria::for_stage(Stage::Pm, profile, min_coverage_pct),
        }
    }
}

impl RoleAgent for PmAgent {
    fn stage(&self) -> Stage {
        Stage::Pm
    }

    fn system_prompt(&self) -> String {
        let mut prompt = PM_SYSTEM_PROMPT.to_string();
        if self.profile == AgentProfile::Strict {
            prompt.push_str("\n\n");
            prompt.push_str(PM_STRICT_ADDENDUM);
        }
        prompt.push_str("\n\n");
        prompt.push_str(&reporting_instructions(&self.criteria));
        prompt
    }

    fn user_prompt(&self, prp: &Prp) -> String {
        let mut prompt = render_prp_header(prp);
        if let Some(prior) = render_prior_evidence(prp) {
            prompt.push_str("\nResults recorded by earlier attempts:\n");
            prompt.push_str(&prior);
            prompt.push('\n');
        }
        prompt.push_str("\nImplement this PRP and report your evidence.");
        prompt
    }

    fn criteria(&self) -> &CompletionCriteria {
        &self.criteria
    }
}
