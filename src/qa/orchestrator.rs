//! Q&A orchestrator: answers questions agents raise mid-stage.
//!
//! A second consumer of Redis, independent of the stage queues:
//!
//! ```text
//! worker --LPUSH--> qa_queue --BLMOVE--> qa_queue:inflight
//!                                              |
//!                                   Claude (PRP + files)
//!                                              |
//! worker <--BLPOP-- qa:answer:<question_id> <--'
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::file_cache::FileCache;
use super::types::{Answer, Question};
use crate::config::Settings;
use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::MetricsCollector;
use crate::prp::{history, keys, ConversationTurn, Prp};

/// Answers are dropped by Redis after this many seconds.
pub const ANSWER_TTL_SECS: u64 = 3600;

const QA_SYSTEM_PROMPT: &str = r#"You answer questions from agents working on a software delivery pipeline.

Each question comes from an agent (PM, Validator or Integration) working on one Product Requirement Prompt (PRP). You are given the PRP and any workspace files the question mentions.

Rules:
- Answer concisely and concretely; the agent will act on your answer immediately.
- Ground your answer in the PRP and the files. If they do not contain the answer, say so and suggest the most reasonable assumption.
- Do not ask questions back."#;

#[derive(Debug, Error)]
pub enum QaError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct QaConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_context_bytes: usize,
    pub block_timeout: Duration,
    pub error_backoff: Duration,
}

impl QaConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.qa_model.clone(),
            max_tokens: settings.qa_max_tokens,
            max_context_bytes: settings.qa_max_context_bytes,
            block_timeout: settings.block_timeout,
            error_backoff: settings.error_backoff,
        }
    }
}

/// Prompt for one question.
///
/// `file_context` is already capped; the PRP body is included whole.
pub fn build_prompt(question: &Question, prp: Option<&Prp>, file_context: &str) -> String {
    let mut prompt = String::new();
    match prp {
        Some(prp) => {
            prompt.push_str(&format!("## PRP {}: {}\n\n{}\n", prp.id, prp.title, prp.content));
            prompt.push_str(&format!("\nCurrent state: {}\n", prp.state));
        }
        None => prompt.push_str(&format!("## PRP {}\n\n(The PRP could not be loaded.)\n", question.prp_id)),
    }
    if !file_context.is_empty() {
        prompt.push_str("\n## Referenced files\n\n");
        prompt.push_str(file_context);
    }
    prompt.push_str(&format!(
        "\n## Question from the {} agent ({})\n\n{}\n",
        question.role, question.agent_id, question.question
    ));
    prompt
}

/// Asks Claude one question. Returns the answer and the history turn.
pub async fn compose_answer(
    llm: &dyn LlmProvider,
    config: &QaConfig,
    question: &Question,
    prompt: String,
) -> Result<(Answer, ConversationTurn), LlmError> {
    let request = GenerationRequest::new(config.model.clone(), vec![Message::user(prompt)])
        .with_system(QA_SYSTEM_PROMPT)
        .with_max_tokens(config.max_tokens);

    let metrics = MetricsCollector::new();
    let started = Instant::now();
    let response = match llm.generate(request).await {
        Ok(response) => response,
        Err(e) => {
            metrics.record_llm_request(&config.model, false, started.elapsed().as_secs_f64(), Default::default());
            return Err(e);
        }
    };
    metrics.record_llm_request(
        &config.model,
        true,
        started.elapsed().as_secs_f64(),
        response.usage,
    );

    let text = response.text().ok_or(LlmError::EmptyCompletion)?;
    let answer = Answer::new(&question.id, text.clone(), response.model.clone());

    let mut turn = ConversationTurn::new(keys::QA_ROLE, question.question.clone(), text);
    turn.model = response.model;
    turn.input_tokens = response.usage.input_tokens;
    turn.output_tokens = response.usage.output_tokens;
    Ok((answer, turn))
}

/// Consumer of `qa_queue`.
pub struct QaOrchestrator {
    redis: ConnectionManager,
    llm: Arc<dyn LlmProvider>,
    files: Option<FileCache>,
    config: QaConfig,
    inflight: String,
    metrics: MetricsCollector,
}

impl QaOrchestrator {
    /// `redis` should be a dedicated connection; the orchestrator blocks
    /// on it.
    pub fn new(redis: ConnectionManager, llm: Arc<dyn LlmProvider>, settings: &Settings) -> Self {
        let files = match FileCache::new(&settings.workspace_root) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(
                    root = %settings.workspace_root.display(),
                    error = %e,
                    "Workspace root unavailable, answering without file context"
                );
                None
            }
        };
        Self {
            redis,
            llm,
            files,
            config: QaConfig::from_settings(settings),
            inflight: keys::inflight_key(keys::QA_QUEUE),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn file_cache(&self) -> Option<&FileCache> {
        self.files.as_ref()
    }

    /// Moves entries left in the inflight list by a previous run back onto
    /// the queue. Returns how many were moved.
    pub async fn recover_inflight(&self) -> Result<usize, QaError> {
        let mut conn = self.redis.clone();
        let mut moved = 0;
        loop {
            let entry: Option<String> = redis::cmd("LMOVE")
                .arg(&self.inflight)
                .arg(keys::QA_QUEUE)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(count = moved, "Recovered unanswered questions");
        }
        Ok(moved)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(model = %self.config.model, "Q&A orchestrator started");
        if let Err(e) = self.recover_inflight().await {
            error!(error = %e, "Failed to recover inflight questions");
        }

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("Q&A orchestrator received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if let Err(e) = self.process_next().await {
                error!(error = %e, "Q&A iteration failed");
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }

        if let Some(files) = &self.files {
            let stats = files.stats();
            info!(
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = stats.hit_rate(),
                "Q&A orchestrator stopped"
            );
        }
    }

    /// Handles at most one question. Returns `false` if none arrived
    /// before the block timeout.
    pub async fn process_next(&self) -> Result<bool, QaError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(keys::QA_QUEUE)
            .arg(&self.inflight)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(self.config.block_timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let question: Question = match serde_json::from_str(&raw) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable question");
                conn.lrem::<_, _, ()>(&self.inflight, 1, &raw).await?;
                return Ok(true);
            }
        };
        debug!(question_id = %question.id, prp_id = %question.prp_id, "Answering question");

        let prp = self.load_prp(&mut conn, &question.prp_id).await?;
        let file_context = match &self.files {
            Some(files) => files.context_for(&question.question, self.config.max_context_bytes),
            None => String::new(),
        };
        let prompt = build_prompt(&question, prp.as_ref(), &file_context);

        match compose_answer(self.llm.as_ref(), &self.config, &question, prompt).await {
            Ok((answer, turn)) => {
                self.deliver(&mut conn, &question, &answer, &raw).await?;
                history::append(&mut conn, &question.prp_id, &turn).await?;
                self.metrics.record_qa_answer(true);
                info!(
                    question_id = %question.id,
                    prp_id = %question.prp_id,
                    agent_id = %question.agent_id,
                    "Question answered"
                );
            }
            Err(e) => {
                // The asking worker times out and carries on without it.
                warn!(question_id = %question.id, error = %e, "Failed to answer question");
                conn.lrem::<_, _, ()>(&self.inflight, 1, &raw).await?;
                self.metrics.record_qa_answer(false);
            }
        }
        Ok(true)
    }

    async fn load_prp(
        &self,
        conn: &mut ConnectionManager,
        prp_id: &str,
    ) -> Result<Option<Prp>, QaError> {
        let hash: HashMap<String, String> = conn.hgetall(keys::prp_key(prp_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        match Prp::from_hash(hash) {
            Ok(prp) => Ok(Some(prp)),
            Err(e) => {
                warn!(prp_id = %prp_id, error = %e, "Malformed PRP hash");
                Ok(None)
            }
        }
    }

    async fn deliver(
        &self,
        conn: &mut ConnectionManager,
        question: &Question,
        answer: &Answer,
        raw: &str,
    ) -> Result<(), QaError> {
        let key = keys::answer_key(&question.id);
        let payload = serde_json::to_string(answer)?;
        redis::pipe()
            .atomic()
            .lpush(&key, payload)
            .ignore()
            .expire(&key, ANSWER_TTL_SECS as i64)
            .ignore()
            .lrem(&self.inflight, 1, raw)
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationResponse, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockLlmProvider {
        response: Mutex<String>,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(response: &str) -> Self {
            Self {
                response: Mutex::new(response.to_string()),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            *self.last_request.lock().expect("lock") = Some(request);
            let content = self.response.lock().expect("lock").clone();
            Ok(GenerationResponse {
                id: "msg_qa".to_string(),
                model: "qa-model".to_string(),
                content: vec![content],
                stop_reason: Some("end_turn".to_string()),
                usage: Usage {
                    input_tokens: 20,
                    output_tokens: 8,
                },
            })
        }
    }

    fn config() -> QaConfig {
        QaConfig::from_settings(&Settings::default())
    }

    #[test]
    fn test_build_prompt_with_prp_and_files() {
        let question = Question::new("7", "validator", "validator-1", "Which test runner?");
        let prp = Prp::with_id("7", "Checkout", "Add Stripe checkout");
        let prompt = build_prompt(&question, Some(&prp), "### Cargo.toml\n```\n[package]\n```\n");

        assert!(prompt.starts_with("## PRP 7: Checkout\n\nAdd Stripe checkout"));
        assert!(prompt.contains("## Referenced files"));
        assert!(prompt.contains("### Cargo.toml"));
        assert!(prompt.contains("Question from the validator agent (validator-1)"));
        assert!(prompt.trim_end().ends_with("Which test runner?"));
    }

    #[test]
    fn test_build_prompt_without_prp() {
        let question = Question::new("8", "pm", "pm-1", "Anything?");
        let prompt = build_prompt(&question, None, "");
        assert!(prompt.contains("could not be loaded"));
        assert!(!prompt.contains("Referenced files"));
    }

    #[tokio::test]
    async fn test_compose_answer() {
        let llm = MockLlmProvider::new("Use cargo nextest.");
        let question = Question::new("9", "validator", "validator-1", "Which test runner?");
        let (answer, turn) = compose_answer(&llm, &config(), &question, "prompt".to_string())
            .await
            .expect("answer");

        assert_eq!(answer.question_id, question.id);
        assert_eq!(answer.answer, "Use cargo nextest.");
        assert_eq!(answer.model, "qa-model");
        assert_eq!(turn.role, "qa");
        assert_eq!(turn.prompt, "Which test runner?");
        assert_eq!(turn.output_tokens, 8);

        let request = llm.last_request.lock().expect("lock").clone().expect("request");
        assert_eq!(request.max_tokens, Some(config().max_tokens));
        assert!(request.system.as_deref().unwrap_or("").contains("Do not ask questions back"));
    }

    #[tokio::test]
    async fn test_compose_answer_rejects_empty_completion() {
        let llm = MockLlmProvider::new("");
        let question = Question::new("9", "pm", "pm-1", "?");
        let result = compose_answer(&llm, &config(), &question, "p".to_string()).await;
        assert!(matches!(result, Err(LlmError::EmptyCompletion)));
    }

    #[test]
    fn test_qa_config_from_settings() {
        let settings = Settings::default();
        let config = QaConfig::from_settings(&settings);
        assert_eq!(config.model, settings.qa_model);
        assert_eq!(config.max_context_bytes, settings.qa_max_context_bytes);
    }
}
