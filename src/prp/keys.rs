//! Redis key layout and PRP hash field names.

/// Set of registered agent ids.
pub const AGENTS_SET: &str = "agents";

/// Queue the workers push questions onto.
pub const QA_QUEUE: &str = "qa_queue";

/// Role name under which Q&A exchanges are recorded.
pub const QA_ROLE: &str = "qa";

/// PRP hash.
pub fn prp_key(prp_id: &str) -> String {
    format!("prp:{}", prp_id)
}

/// Conversation history list of one role for one PRP.
pub fn history_key(prp_id: &str, role: &str) -> String {
    format!("prp:{}:history:{}", prp_id, role)
}

/// SCAN pattern matching every history list.
pub const HISTORY_PATTERN: &str = "prp:*:history:*";

/// Split a history key into `(prp_id, role)`.
pub fn parse_history_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("prp:")?;
    let (prp_id, role) = rest.rsplit_once(":history:")?;
    if prp_id.is_empty() || role.is_empty() {
        return None;
    }
    Some((prp_id, role))
}

/// Inflight list paired with a queue.
pub fn inflight_key(queue: &str) -> String {
    format!("{}:inflight", queue)
}

/// Dead-letter list paired with a queue.
pub fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead_letter", queue)
}

/// Agent status hash.
pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// List an answer to one question is pushed onto.
pub fn answer_key(question_id: &str) -> String {
    format!("qa:answer:{}", question_id)
}

/// Field names of the PRP hash.
pub mod field {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const CONTENT: &str = "content";
    pub const STATE: &str = "state";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const LAST_ERROR: &str = "last_error";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const FAILED_AT: &str = "failed_at";

    pub const PROCESSING_STARTED_AT: &str = "processing_started_at";
    pub const PROCESSING_WORKER: &str = "processing_worker";
    pub const PROCESSING_QUEUE: &str = "processing_queue";

    /// Fields owned by the pipeline rather than by agent evidence.
    pub const RESERVED: &[&str] = &[
        ID,
        TITLE,
        CONTENT,
        STATE,
        RETRY_COUNT,
        CREATED_AT,
        UPDATED_AT,
        LAST_ERROR,
        FAILURE_REASON,
        FAILED_AT,
        PROCESSING_STARTED_AT,
        PROCESSING_WORKER,
        PROCESSING_QUEUE,
    ];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }

    /// `<role>_completed_at`
    pub fn completed_at(role: &str) -> String {
        format!("{}_completed_at", role)
    }

    /// `<role>_completed_by`
    pub fn completed_by(role: &str) -> String {
        format!("{}_completed_by", role)
    }
}
