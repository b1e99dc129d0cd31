//! How workers ask the Q&A orchestrator for help mid-stage.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::error::AgentResult;
use crate::prp::{keys, AgentState};
use crate::qa::{Answer, Question};

/// Transport for questions raised by an agent.
#[async_trait]
pub trait QuestionChannel: Send + Sync {
    /// Ask every question and wait a bounded time for answers.
    ///
    /// Returns one slot per question, in order; `None` means no answer
    /// arrived in time.
    async fn ask(&self, questions: &[Question]) -> AgentResult<Vec<Option<Answer>>>;
}

/// A channel that never gets answers. Agents run without Q&A.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuestions;

#[async_trait]
impl QuestionChannel for NoQuestions {
    async fn ask(&self, questions: &[Question]) -> AgentResult<Vec<Option<Answer>>> {
        Ok(vec![None; questions.len()])
    }
}

/// Questions go onto `qa_queue`; answers come back on
/// `qa:answer:<question_id>`.
pub struct RedisQuestionChannel {
    redis: ConnectionManager,
    wait_timeout: Duration,
}

impl RedisQuestionChannel {
    /// `redis` may be the worker's own connection: the worker is idle
    /// while it waits.
    pub fn new(redis: ConnectionManager, wait_timeout: Duration) -> Self {
        Self {
            redis,
            wait_timeout,
        }
    }

    async fn wait_for(
        &self,
        conn: &mut ConnectionManager,
        question: &Question,
        deadline: Instant,
    ) -> AgentResult<Option<Answer>> {
        let key = keys::answer_key(&question.id);
        let remaining = deadline.saturating_duration_since(Instant::now());

        let raw: Option<String> = if remaining.is_zero() {
            // Out of time; take an answer only if it is already there.
            conn.lpop(&key, None).await?
        } else {
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&key)
                .arg(remaining.as_secs().max(1))
                .query_async(conn)
                .await?;
            popped.map(|(_, value)| value)
        };

        let Some(raw) = raw else {
            tracing::warn!(question_id = %question.id, prp_id = %question.prp_id, "No answer before timeout");
            return Ok(None);
        };

        match serde_json::from_str::<Answer>(&raw) {
            Ok(answer) => Ok(Some(answer)),
            Err(e) => {
                tracing::warn!(question_id = %question.id, error = %e, "Discarding malformed answer");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl QuestionChannel for RedisQuestionChannel {
    async fn ask(&self, questions: &[Question]) -> AgentResult<Vec<Option<Answer>>> {
        let Some(first) = questions.first() else {
            return Ok(Vec::new());
        };
        let mut conn = self.redis.clone();

        redis::pipe()
            .hset(keys::agent_key(&first.agent_id), "status", AgentState::WaitingForAnswer.as_str())
            .ignore()
            .hset(
                keys::agent_key(&first.agent_id),
                "last_activity",
                chrono::Utc::now().timestamp(),
            )
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        for question in questions {
            let payload = serde_json::to_string(question)?;
            conn.lpush::<_, _, ()>(keys::QA_QUEUE, payload).await?;
            tracing::info!(
                question_id = %question.id,
                prp_id = %question.prp_id,
                agent_id = %question.agent_id,
                "Question sent to Q&A orchestrator"
            );
        }

        let deadline = Instant::now() + self.wait_timeout;
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            answers.push(self.wait_for(&mut conn, question, deadline).await?);
        }
        Ok(answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_questions_never_answers() {
        let questions = vec![
            Question::new("1", "pm", "pm-1", "a?"),
            Question::new("1", "pm", "pm-1", "b?"),
        ];
        let answers = NoQuestions.ask(&questions).await.expect("ask");
        assert_eq!(answers, vec![None, None]);
        assert!(NoQuestions.ask(&[]).await.expect("ask").is_empty());
    }
}
