//! Wire types exchanged between workers and the Q&A orchestrator.

use serde::{Deserialize, Serialize};

/// A question pushed onto `qa_queue` by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prp_id: String,
    /// Role of the asking agent.
    pub role: String,
    pub agent_id: String,
    pub question: String,
    /// Unix seconds.
    pub asked_at: i64,
}

impl Question {
    pub fn new(
        prp_id: impl Into<String>,
        role: impl Into<String>,
        agent_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prp_id: prp_id.into(),
            role: role.into(),
            agent_id: agent_id.into(),
            question: question.into(),
            asked_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// An answer pushed onto `qa:answer:<question_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub answer: String,
    /// Unix seconds.
    pub answered_at: i64,
    #[serde(default)]
    pub model: String,
}

impl Answer {
    pub fn new(question_id: impl Into<String>, answer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            answer: answer.into(),
            answered_at: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_json_shape() {
        let q = Question::new("42", "pm", "pm-1", "Which DB?");
        let json: serde_json::Value = serde_json::to_value(&q).expect("json");
        for key in ["id", "prp_id", "role", "agent_id", "question", "asked_at"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        let back: Question = serde_json::from_value(json).expect("parse");
        assert_eq!(back, q);
    }

    #[test]
    fn test_answer_model_defaults() {
        let a: Answer =
            serde_json::from_str(r#"{"question_id":"q","answer":"Postgres","answered_at":1}"#)
                .expect("parse");
        assert!(a.model.is_empty());
        assert_eq!(a.answer, "Postgres");
    }
}
