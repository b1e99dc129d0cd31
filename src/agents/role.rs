//! The `RoleAgent` trait implemented by every pipeline role.

use super::criteria::{CompletionCriteria, Requirement};
use crate::evidence::QUESTION_MARKER;
use crate::prp::Prp;
use crate::scheduler::Stage;

/// Prompt templates and completion criteria of one pipeline role.
///
/// Implementations hold no state and do no I/O; the worker drives them.
pub trait RoleAgent: Send + Sync {
    /// Stage this agent works on.
    fn stage(&self) -> Stage;

    /// Role name used in history keys and completion fields.
    fn role(&self) -> &'static str {
        self.stage().role()
    }

    /// System prompt sent with every call.
    fn system_prompt(&self) -> String;

    /// First prompt of a stage attempt.
    fn user_prompt(&self, prp: &Prp) -> String;

    /// What the evidence must show before the stage is promoted.
    fn criteria(&self) -> &CompletionCriteria;
}

/// Instructions shared by every role on how to report evidence and ask
/// questions.
pub fn reporting_instructions(criteria: &CompletionCriteria) -> String {
    let mut lines = vec![
        "When you finish, report your results as a single JSON object inside a ```json fenced block.".to_string(),
        "Include at least these keys:".to_string(),
    ];
    for req in criteria.requirements() {
        let line = match req {
            Requirement::Flag(key) => format!("- \"{}\": true or false", key),
            Requirement::AtLeast(key, min) => {
                format!("- \"{}\": a number (must reach {} to pass)", key, min)
            }
        };
        lines.push(line);
    }
    lines.push(
        "You may add further keys (summary, notes, artifacts). Never claim a check passed unless it did."
            .to_string(),
    );
    lines.push(format!(
        "If you are blocked on information, write a line starting with `{}` followed by one question. Ask only what you cannot find out yourself.",
        QUESTION_MARKER
    ));
    lines.join("\n")
}

/// Render the non-reserved fields of a PRP as a bullet list, skipping
/// completion stamps.
pub fn render_prior_evidence(prp: &Prp) -> Option<String> {
    let lines: Vec<String> = prp
        .fields
        .iter()
        .filter(|(k, _)| !k.ends_with("_completed_at") && !k.ends_with("_completed_by"))
        .map(|(k, v)| format!("- {}: {}", k, v))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Common PRP header used at the top of every user prompt.
pub fn render_prp_header(prp: &Prp) -> String {
    let mut out = format!("PRP {}", prp.id);
    if !prp.title.is_empty() {
        out.push_str(&format!(": {}", prp.title));
    }
    out.push_str(&format!("\n\n{}\n", prp.content.trim()));
    if prp.retry_count > 0 {
        out.push_str(&format!(
            "\nThis is attempt {} at this stage.",
            prp.retry_count + 1
        ));
        if let Some(err) = &prp.last_error {
            out.push_str(&format!(" The previous attempt ended with: {}", err));
        }
        out.push('\n');
    }
    out
}
