//! Role agents of the pipeline and the worker that drives them.

pub mod criteria;
pub mod error;
pub mod integration;
pub mod persona;
pub mod pm;
pub mod questions;
pub mod role;
pub mod validator;
pub mod worker;

use std::sync::Arc;

pub use criteria::{CompletionCriteria, Requirement};
pub use error::{AgentError, AgentResult};
pub use integration::IntegrationAgent;
pub use persona::{Persona, WithPersona};
pub use pm::PmAgent;
pub use questions::{NoQuestions, QuestionChannel, RedisQuestionChannel};
pub use role::RoleAgent;
pub use validator::ValidatorAgent;
pub use worker::{run_stage, AgentWorker, StageContext, StageRun, StageVerdict, WorkerConfig};

use crate::config::Settings;
use crate::scheduler::Stage;

/// Builds the agent of `stage` with its default persona.
pub fn build_agent(stage: Stage, settings: &Settings) -> Arc<dyn RoleAgent> {
    match stage {
        Stage::Pm => Arc::new(WithPersona::default_for(PmAgent::new(
            settings.profile,
            settings.min_coverage_pct,
        ))),
        Stage::Validation => Arc::new(WithPersona::default_for(ValidatorAgent::new(
            settings.profile,
        ))),
        Stage::Integration => Arc::new(WithPersona::default_for(IntegrationAgent::new(
            settings.profile,
        ))),
    }
}
