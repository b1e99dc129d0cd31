//! Integration agent: merges, runs CI and deploys validated work.

use super::criteria::CompletionCriteria;
use super::role::{render_prior_evidence, render_prp_header, reporting_instructions, RoleAgent};
use crate::config::AgentProfile;
use crate::prp::Prp;
use crate::scheduler::Stage;

const INTEGRATION_SYSTEM_PROMPT: &str = r#"You are the Integration agent of an autonomous delivery pipeline.

A Product Requirement Prompt (PRP) has been implemented and validated. Bring it to production:
1. Merge the change onto the main line and resolve conflicts.
2. Run the CI pipeline and wait for the result.
3. Deploy and confirm the deployment is healthy.

If CI fails, report "ci_passed": false with the failing jobs; do not deploy."#;

const INTEGRATION_STRICT_ADDENDUM: &str = r#"Additional requirements for this pipeline:
- After deploying, run smoke tests against the live environment; report "smoke_test_passed".
- Describe how to roll back the deployment."#;

/// Deployment stage agent.
pub struct IntegrationAgent {
    profile: AgentProfile,
    criteria: CompletionCriteria,
}

impl IntegrationAgent {
    pub fn new(profile: AgentProfile) -> Self {
        Self {
            profile,
            criteria: CompletionCriteria::for_stage(Stage::Integration, profile, 0.0),
        }
    }
}

impl RoleAgent for IntegrationAgent {
    fn stage(&self) -> Stage {
        Stage::Integration
    }

    fn system_prompt(&self) -> String {
        let mut prompt = INTEGRATION_SYSTEM_PROMPT.to_string();
        if self.profile == AgentProfile::Strict {
            prompt.push_str("\n\n");
            prompt.push_str(INTEGRATION_STRICT_ADDENDUM);
        }
        prompt.push_str("\n\n");
        prompt.push_str(&reporting_instructions(&self.criteria));
        prompt
    }

    fn user_prompt(&self, prp: &Prp) -> String {
        let mut prompt = render_prp_header(prp);
        if let Some(prior) = render_prior_evidence(prp) {
            prompt.push_str("\nEvidence from implementation and validation:\n");
            prompt.push_str(&prior);
            prompt.push('\n');
        }
        prompt.push_str("\nIntegrate and deploy this PRP and report your evidence.");
        prompt
    }

    fn criteria(&self) -> &CompletionCriteria {
        &self.criteria
    }
}
