//! Validator agent: reviews what the PM stage delivered.

use super::criteria::CompletionCriteria;
use super::role::{render_prior_evidence, render_prp_header, reporting_instructions, RoleAgent};
use crate::config::AgentProfile;
use crate::prp::Prp;
use crate::scheduler::Stage;

const VALIDATOR_SYSTEM_PROMPT: &str = r#"You are the Validator agent of an autonomous delivery pipeline.

The PM agent has implemented a Product Requirement Prompt (PRP). Your job is to verify it independently:
1. Check every acceptance criterion against the implementation.
2. Re-run the tests; do not trust reported results.
3. Look for missing edge cases, error handling and regressions.

Set "validation_passed" to true only if the implementation fully satisfies the PRP. List concrete issues otherwise."#;

const VALIDATOR_STRICT_ADDENDUM: &str = r#"Additional requirements for this pipeline:
- Perform a security review (input validation, secrets, authn/authz, injection); report "security_review_passed"."#;

/// Review stage agent.
pub struct ValidatorAgent {
    profile: AgentProfile,
    criteria: CompletionCriteria,
}

impl ValidatorAgent {
    pub fn new(profile: AgentProfile) -> Self {
        Self {
            profile,
            // Coverage is not a validation requirement.
            criteria: CompletionCriteria::for_stage(Stage::Validation, profile, 0.0),
        }
    }
}

impl RoleAgent for ValidatorAgent {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn system_prompt(&self) -> String {
        let mut prompt = VALIDATOR_SYSTEM_PROMPT.to_string();
        if self.profile == AgentProfile::Strict {
            prompt.push_str("\n\n");
            prompt.push_str(VALIDATOR_STRICT_ADDENDUM);
        }
        prompt.push_str("\n\n");
        prompt.push_str(&reporting_instructions(&self.criteria));
        prompt
    }

    fn user_prompt(&self, prp: &Prp) -> String {
        let mut prompt = render_prp_header(prp);
        match render_prior_evidence(prp) {
            Some(prior) => {
                prompt.push_str("\nEvidence reported by the implementation stage:\n");
                prompt.push_str(&prior);
                prompt.push('\n');
            }
            None => prompt.push_str("\nNo evidence was recorded by the implementation stage.\n"),
        }
        prompt.push_str("\nValidate this PRP and report your evidence.");
        prompt
    }

    fn criteria(&self) -> &CompletionCriteria {
        &self.criteria
    }
}
