//! Personas: canned role-flavored text prepended to an agent's system
//! prompt. They change wording only, never behavior.

use super::criteria::CompletionCriteria;
use super::role::RoleAgent;
use crate::prp::Prp;
use crate::scheduler::Stage;

/// A named block of persona instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: &'static str,
    pub title: &'static str,
    /// Second-person fragments, each rendered as "- You <trait>."
    pub traits: &'static [&'static str],
}

impl Persona {
    /// Default persona of each stage.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Pm => Persona {
                name: "Avery",
                title: "Senior Product Engineer",
                traits: &[
                    "turn vague requirements into precise acceptance criteria",
                    "ship in small, tested increments",
                ],
            },
            Stage::Validation => Persona {
                name: "Morgan",
                title: "Principal QA Engineer",
                traits: &[
                    "assume nothing works until proven",
                    "write the edge-case test everyone forgot",
                ],
            },
            Stage::Integration => Persona {
                name: "Riley",
                title: "Site Reliability Engineer",
                traits: &[
                    "treat production as sacred",
                    "always have a rollback plan",
                ],
            },
        }
    }

    /// The text block injected into prompts.
    pub fn block(&self) -> String {
        let mut out = format!("You are {}, {}.", self.name, self.title);
        for t in self.traits {
            out.push_str(&format!("\n- You {}.", t));
        }
        out
    }
}

/// Decorates another agent's system prompt with a persona.
pub struct WithPersona<A> {
    inner: A,
    persona: Persona,
}

impl<A: RoleAgent> WithPersona<A> {
    pub fn new(inner: A, persona: Persona) -> Self {
        Self { inner, persona }
    }

    /// Uses the stage's default persona.
    pub fn default_for(inner: A) -> Self {
        let persona = Persona::for_stage(inner.stage());
        Self::new(inner, persona)
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }
}

impl<A: RoleAgent> RoleAgent for WithPersona<A> {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn system_prompt(&self) -> String {
        format!("{}\n\n{}", self.persona.block(), self.inner.system_prompt())
    }

    fn user_prompt(&self, prp: &Prp) -> String {
        self.inner.user_prompt(prp)
    }

    fn criteria(&self) -> &CompletionCriteria {
        self.inner.criteria()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ValidatorAgent;
    use crate::config::AgentProfile;

    #[test]
    fn test_persona_block() {
        let block = Persona::for_stage(Stage::Integration).block();
        assert!(block.starts_with("You are Riley, Site Reliability Engineer."));
        assert!(block.contains("\n- You always have a rollback plan."));
    }

    #[test]
    fn test_persona_traits_read_in_second_person() {
        for stage in Stage::ALL {
            let persona = Persona::for_stage(stage);
            for t in persona.traits {
                let first = t.split_whitespace().next().unwrap_or_default();
                assert!(
                    !first.ends_with('s') || first == "always",
                    "{:?} trait {:?} does not follow \"You\"",
                    stage,
                    t
                );
                assert!(!t.contains(" has "), "{:?} trait {:?}", stage, t);
            }
        }
    }

    #[test]
    fn test_with_persona_only_changes_system_prompt() {
        let plain = ValidatorAgent::new(AgentProfile::Standard);
        let decorated = WithPersona::default_for(ValidatorAgent::new(AgentProfile::Standard));
        let prp = Prp::with_id("5", "t", "c");

        assert!(decorated.system_prompt().starts_with("You are Morgan"));
        assert!(decorated.system_prompt().ends_with(&plain.system_prompt()));
        assert_eq!(decorated.user_prompt(&prp), plain.user_prompt(&prp));
        assert_eq!(decorated.criteria(), plain.criteria());
        assert_eq!(decorated.role(), "validator");
    }
}
