//! Worker loop that drives one role agent against its stage queue.
//!
//! Each iteration: write status, claim a job, run the stage (Claude call,
//! evidence extraction, optional Q&A rounds), then promote or requeue.
//! Failures never escape the loop: they are logged, reflected in the
//! agent status, and followed by a backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::criteria::describe;
use super::error::{AgentError, AgentResult};
use super::questions::QuestionChannel;
use super::role::RoleAgent;
use crate::config::Settings;
use crate::error::LlmError;
use crate::evidence::{extract_evidence, extract_questions, Evidence};
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::MetricsCollector;
use crate::prp::{history, status, AgentState, AgentStatus, ConversationTurn, Lifecycle, Prp};
use crate::qa::{Answer, Question};
use crate::scheduler::{ClaimOutcome, ClaimedJob, PromoteOutcome, RequeueOutcome, StageQueue};

/// Tunables of one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub block_timeout: Duration,
    pub error_backoff: Duration,
    pub history_window: usize,
    pub qa_max_rounds: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            block_timeout: settings.block_timeout,
            error_backoff: settings.error_backoff,
            history_window: settings.history_window,
            qa_max_rounds: settings.qa_max_rounds,
        }
    }

    /// Sets the number of Q&A follow-up rounds.
    pub fn with_qa_max_rounds(mut self, rounds: u32) -> Self {
        self.qa_max_rounds = rounds;
        self
    }
}

/// How a stage attempt ended.
#[derive(Debug)]
pub enum StageVerdict {
    /// Criteria met; `evidence` is what this attempt reported.
    Complete { evidence: Evidence },
    /// Criteria not met.
    Incomplete {
        evidence: Evidence,
        /// Rendered unmet requirements, e.g. `coverage_pct >= 80`.
        missing: String,
    },
    /// The first Claude call failed; nothing was learned.
    NoProgress(LlmError),
}

/// Outcome of [`run_stage`]: the verdict plus turns to append to history.
#[derive(Debug)]
pub struct StageRun {
    pub verdict: StageVerdict,
    pub turns: Vec<ConversationTurn>,
    /// Questions asked across all rounds.
    pub questions_asked: usize,
}

/// Who is running the stage, for question attribution.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub agent_id: &'a str,
    pub config: &'a WorkerConfig,
}

/// One Claude call. Returns the text and a recorded turn.
async fn call_llm(
    agent: &dyn RoleAgent,
    llm: &dyn LlmProvider,
    config: &WorkerConfig,
    messages: Vec<Message>,
    prompt: &str,
    attempt: u32,
) -> Result<(String, ConversationTurn), LlmError> {
    let request = GenerationRequest::new(config.model.clone(), messages)
        .with_system(agent.system_prompt())
        .with_temperature(config.temperature)
        .with_max_tokens(config.max_tokens);

    let metrics = MetricsCollector::new();
    let started = Instant::now();
    let result = llm.generate(request).await;
    let latency = started.elapsed().as_secs_f64();

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            metrics.record_llm_request(&config.model, false, latency, Default::default());
            return Err(e);
        }
    };
    metrics.record_llm_request(&config.model, true, latency, response.usage);

    if response.was_truncated() {
        warn!(role = agent.role(), model = %response.model, "Response hit max_tokens");
    }
    let text = response.text().ok_or(LlmError::EmptyCompletion)?;

    let mut turn = ConversationTurn::new(agent.role(), prompt, text.clone());
    turn.model = response.model;
    turn.input_tokens = response.usage.input_tokens;
    turn.output_tokens = response.usage.output_tokens;
    turn.attempt = attempt;
    Ok((text, turn))
}

/// Follow-up prompt carrying answers back to the agent.
pub fn follow_up_prompt(questions: &[Question], answers: &[Option<Answer>]) -> String {
    let mut prompt = String::from("Answers to your questions:\n");
    for (question, answer) in questions.iter().zip(answers) {
        prompt.push_str(&format!("\nQ: {}\n", question.question));
        match answer {
            Some(a) => prompt.push_str(&format!("A: {}\n", a.answer.trim())),
            None => prompt.push_str("A: No answer is available. Proceed with your best judgement.\n"),
        }
    }
    prompt.push_str("\nContinue the work and report your updated evidence.");
    prompt
}

/// Runs one stage attempt without touching the queue.
///
/// Replays `history`, sends the agent's prompt, extracts evidence and
/// questions, and runs up to `qa_max_rounds` question rounds. Criteria are
/// evaluated over the PRP's existing fields overlaid with the new evidence.
///
/// # Errors
///
/// Only question-channel failures are errors. A failed first Claude call
/// is a [`StageVerdict::NoProgress`]; a failed follow-up call ends the
/// rounds and keeps the evidence gathered so far.
pub async fn run_stage(
    agent: &dyn RoleAgent,
    llm: &dyn LlmProvider,
    questions: &dyn QuestionChannel,
    ctx: StageContext<'_>,
    prp: &Prp,
    past_turns: &[ConversationTurn],
) -> AgentResult<StageRun> {
    let config = ctx.config;
    let prompt = agent.user_prompt(prp);
    let mut messages = history::replay(past_turns);
    messages.push(Message::user(prompt.clone()));

    let (mut text, turn) =
        match call_llm(agent, llm, config, messages.clone(), &prompt, prp.retry_count).await {
            Ok(result) => result,
            Err(e) => {
                return Ok(StageRun {
                    verdict: StageVerdict::NoProgress(e),
                    turns: Vec::new(),
                    questions_asked: 0,
                })
            }
        };
    let mut turns = vec![turn];
    let mut evidence = extract_evidence(&text);
    let mut pending = extract_questions(&text);
    let mut questions_asked = 0;

    let mut round = 0;
    while !pending.is_empty() && round < config.qa_max_rounds {
        round += 1;
        let batch: Vec<Question> = pending
            .iter()
            .map(|q| Question::new(&prp.id, agent.role(), ctx.agent_id, q.as_str()))
            .collect();
        questions_asked += batch.len();

        let answers = questions.ask(&batch).await?;
        if answers.iter().all(Option::is_none) {
            debug!(prp_id = %prp.id, round = round, "No answers received, ending Q&A rounds");
            break;
        }

        let follow_up = follow_up_prompt(&batch, &answers);
        messages.push(Message::assistant(text.clone()));
        messages.push(Message::user(follow_up.clone()));

        match call_llm(agent, llm, config, messages.clone(), &follow_up, prp.retry_count).await {
            Ok((next_text, turn)) => {
                evidence = evidence.overlay(&extract_evidence(&next_text));
                pending = extract_questions(&next_text);
                text = next_text;
                turns.push(turn);
            }
            Err(e) => {
                warn!(prp_id = %prp.id, error = %e, "Follow-up call failed, keeping evidence so far");
                break;
            }
        }
    }

    let existing = Evidence::from_hash_fields(&prp.fields);
    let combined = existing.overlay(&evidence);
    let unmet = agent.criteria().unmet(&combined);

    let verdict = if unmet.is_empty() {
        StageVerdict::Complete { evidence }
    } else {
        StageVerdict::Incomplete {
            evidence,
            missing: describe(&unmet),
        }
    };

    Ok(StageRun {
        verdict,
        turns,
        questions_asked,
    })
}

/// Long-running consumer of one stage queue.
pub struct AgentWorker {
    id: String,
    agent: Arc<dyn RoleAgent>,
    llm: Arc<dyn LlmProvider>,
    queue: StageQueue,
    questions: Arc<dyn QuestionChannel>,
    config: WorkerConfig,
    metrics: MetricsCollector,
}

impl AgentWorker {
    /// `queue` must own its connection; `claim` blocks on it.
    pub fn new(
        id: impl Into<String>,
        agent: Arc<dyn RoleAgent>,
        llm: Arc<dyn LlmProvider>,
        queue: StageQueue,
        questions: Arc<dyn QuestionChannel>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            agent,
            llm,
            queue,
            questions,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Processes jobs until a shutdown signal arrives.
    ///
    /// The signal is checked once per iteration; a stage in progress runs
    /// to completion.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker_id = %self.id, role = self.agent.role(), queue = self.queue.name(), "Worker started");
        let mut agent_status = AgentStatus::new(&self.id, self.agent.role());
        self.write_status(&mut agent_status, AgentState::Starting, None).await;

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            self.write_status(&mut agent_status, AgentState::Idle, None).await;

            if let Err(e) = self.iteration(&mut agent_status).await {
                error!(worker_id = %self.id, error = %e, "Worker iteration failed");
                self.write_status(&mut agent_status, AgentState::Error, None).await;
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }

        self.write_status(&mut agent_status, AgentState::Stopped, None).await;
        info!(
            worker_id = %self.id,
            processed = agent_status.processed,
            failed = agent_status.failed,
            "Worker stopped"
        );
    }

    async fn write_status(&self, agent_status: &mut AgentStatus, state: AgentState, prp_id: Option<&str>) {
        agent_status.state = state;
        agent_status.current_prp = prp_id.map(str::to_string);
        agent_status.last_activity = chrono::Utc::now().timestamp();
        let mut conn = self.queue.connection();
        if let Err(e) = status::write(&mut conn, agent_status).await {
            warn!(worker_id = %self.id, error = %e, "Failed to write agent status");
        }
    }

    /// Claim and process at most one job.
    async fn iteration(&self, agent_status: &mut AgentStatus) -> AgentResult<()> {
        let job = match self.queue.claim(&self.id, self.config.block_timeout).await? {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Empty => {
                debug!(worker_id = %self.id, "No jobs available");
                return Ok(());
            }
            ClaimOutcome::Orphaned(_) | ClaimOutcome::Terminal(_) => return Ok(()),
        };

        info!(worker_id = %self.id, prp_id = %job.prp_id, "Claimed PRP");
        self.write_status(agent_status, AgentState::Processing, Some(&job.prp_id))
            .await;

        let started = Instant::now();
        let outcome = match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Any processing failure counts as an attempt.
                error!(worker_id = %self.id, prp_id = %job.prp_id, error = %e, "Processing failed");
                let reason = format!("processing error: {}", e);
                match self.queue.requeue(&job.prp_id, &reason).await? {
                    RequeueOutcome::Failed { .. } => "failed",
                    _ => "requeued",
                }
            }
        };

        match outcome {
            "promoted" | "complete" => agent_status.processed += 1,
            "failed" => agent_status.failed += 1,
            _ => {}
        }
        self.metrics
            .record_stage(self.agent.role(), outcome, started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Runs the stage for a claimed job and settles it on the queue.
    ///
    /// Returns the outcome label used for metrics.
    async fn process(&self, job: &ClaimedJob) -> AgentResult<&'static str> {
        let prp = self
            .queue
            .load_prp(&job.prp_id)
            .await?
            .ok_or_else(|| AgentError::PrpNotFound(job.prp_id.clone()))?;

        let mut conn = self.queue.connection();
        let past_turns =
            history::recent(&mut conn, &prp.id, self.agent.role(), self.config.history_window)
                .await?;

        let ctx = StageContext {
            agent_id: &self.id,
            config: &self.config,
        };
        let run = run_stage(
            self.agent.as_ref(),
            self.llm.as_ref(),
            self.questions.as_ref(),
            ctx,
            &prp,
            &past_turns,
        )
        .await?;

        for turn in &run.turns {
            history::append(&mut conn, &prp.id, turn).await?;
        }

        match run.verdict {
            StageVerdict::NoProgress(e) => {
                warn!(worker_id = %self.id, prp_id = %prp.id, error = %e, "Claude call failed, releasing PRP");
                self.queue
                    .release(&prp.id, &format!("llm unavailable: {}", e))
                    .await?;
                tokio::time::sleep(self.config.error_backoff).await;
                Ok("released")
            }
            StageVerdict::Incomplete { evidence, missing } => {
                self.queue.record_evidence(&prp.id, &evidence).await?;
                let reason = format!("incomplete evidence: {}", missing);
                info!(worker_id = %self.id, prp_id = %prp.id, reason = %reason, "Stage incomplete");
                Ok(self.requeue_label(&prp.id, &reason).await?)
            }
            StageVerdict::Complete { evidence } => {
                let stage = self.agent.stage();
                if let Err(e) = Lifecycle::new().check(prp.state, stage.next_state()) {
                    warn!(prp_id = %prp.id, error = %e, "Promoting PRP from unexpected state");
                }
                let result = self.queue.promote(job, &evidence).await;
                let held_secs = job.held_for(chrono::Utc::now().timestamp());
                match result {
                    Ok(PromoteOutcome::Promoted { next }) => {
                        info!(worker_id = %self.id, prp_id = %prp.id, next = %next, held_secs, "PRP promoted");
                        Ok("promoted")
                    }
                    Ok(PromoteOutcome::Complete) => {
                        info!(worker_id = %self.id, prp_id = %prp.id, held_secs, "PRP complete");
                        Ok("complete")
                    }
                    Err(e) => {
                        error!(worker_id = %self.id, prp_id = %prp.id, error = %e, "Promote script failed");
                        let reason = format!("promote failed: {}", e);
                        Ok(self.requeue_label(&prp.id, &reason).await?)
                    }
                }
            }
        }
    }

    async fn requeue_label(&self, prp_id: &str, reason: &str) -> AgentResult<&'static str> {
        let label = match self.queue.requeue(prp_id, reason).await? {
            RequeueOutcome::Failed { .. } => "failed",
            RequeueOutcome::Requeued { .. } => "requeued",
            other => {
                warn!(worker_id = %self.id, prp_id = %prp_id, outcome = other.as_str(), "Requeue found job elsewhere");
                "lost"
            }
        };
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{NoQuestions, PmAgent, ValidatorAgent};
    use crate::config::AgentProfile;
    use crate::llm::{GenerationResponse, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with canned responses in order; errors once they run out.
    struct MockLlmProvider {
        responses: Mutex<Vec<String>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().expect("lock").push(request);
            let next = self.responses.lock().expect("lock").pop();
            match next {
                Some(text) => Ok(GenerationResponse {
                    id: "msg_test".to_string(),
                    model: "mock-model".to_string(),
                    content: vec![text],
                    stop_reason: Some("end_turn".to_string()),
                    usage: Usage {
                        input_tokens: 100,
                        output_tokens: 50,
                    },
                }),
                None => Err(LlmError::Overloaded("mock exhausted".to_string())),
            }
        }
    }

    /// Answers every question with the same text.
    struct CannedAnswers(&'static str);

    #[async_trait]
    impl QuestionChannel for CannedAnswers {
        async fn ask(&self, questions: &[Question]) -> AgentResult<Vec<Option<Answer>>> {
            Ok(questions
                .iter()
                .map(|q| Some(Answer::new(&q.id, self.0, "mock-model")))
                .collect())
        }
    }

    fn ctx(config: &WorkerConfig) -> StageContext<'_> {
        StageContext {
            agent_id: "pm-test",
            config,
        }
    }

    #[tokio::test]
    async fn test_complete_when_criteria_met() {
        let agent = PmAgent::new(AgentProfile::Standard, 80.0);
        let llm = MockLlmProvider::new(&[
            "Implemented.\n```json\n{\"tests_passed\": true, \"coverage_pct\": 92}\n```",
        ]);
        let config = WorkerConfig::default();
        let prp = Prp::with_id("1", "Login", "OAuth login");

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");

        match run.verdict {
            StageVerdict::Complete { evidence } => {
                assert!(evidence.flag("tests_passed"));
                assert_eq!(evidence.number("coverage_pct"), Some(92.0));
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
        assert_eq!(run.turns.len(), 1);
        assert_eq!(run.turns[0].role, "pm");
        assert_eq!(run.turns[0].input_tokens, 100);
    }

    #[tokio::test]
    async fn test_incomplete_lists_unmet_requirements() {
        let agent = PmAgent::new(AgentProfile::Standard, 80.0);
        let llm = MockLlmProvider::new(&["```json\n{\"tests_passed\": true, \"coverage_pct\": 40}\n```"]);
        let config = WorkerConfig::default();
        let prp = Prp::with_id("2", "t", "c");

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");

        match run.verdict {
            StageVerdict::Incomplete { missing, .. } => {
                assert_eq!(missing, "coverage_pct >= 80");
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existing_fields_count_towards_criteria() {
        let agent = PmAgent::new(AgentProfile::Standard, 80.0);
        let llm = MockLlmProvider::new(&["Coverage fixed.\n```json\n{\"coverage_pct\": 85}\n```"]);
        let config = WorkerConfig::default();
        let mut prp = Prp::with_id("3", "t", "c");
        prp.fields.insert("tests_passed".to_string(), "true".to_string());

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");
        assert!(matches!(run.verdict, StageVerdict::Complete { .. }));
    }

    #[tokio::test]
    async fn test_llm_failure_is_no_progress() {
        let agent = ValidatorAgent::new(AgentProfile::Standard);
        let llm = MockLlmProvider::new(&[]);
        let config = WorkerConfig::default();
        let prp = Prp::with_id("4", "t", "c");

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");
        assert!(matches!(run.verdict, StageVerdict::NoProgress(LlmError::Overloaded(_))));
        assert!(run.turns.is_empty());
    }

    #[tokio::test]
    async fn test_empty_completion_is_no_progress() {
        let agent = ValidatorAgent::new(AgentProfile::Standard);
        let llm = MockLlmProvider::new(&["   "]);
        let config = WorkerConfig::default();
        let prp = Prp::with_id("5", "t", "c");

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");
        assert!(matches!(run.verdict, StageVerdict::NoProgress(LlmError::EmptyCompletion)));
    }

    #[tokio::test]
    async fn test_questions_trigger_follow_up_round() {
        let agent = ValidatorAgent::new(AgentProfile::Standard);
        let llm = MockLlmProvider::new(&[
            "I need context.\nQUESTION: Where are the integration tests?",
            "Thanks.\n```json\n{\"validation_passed\": true}\n```",
        ]);
        let config = WorkerConfig::default().with_qa_max_rounds(2);
        let prp = Prp::with_id("6", "t", "c");

        let run = run_stage(
            &agent,
            &llm,
            &CannedAnswers("Under tests/integration."),
            ctx(&config),
            &prp,
            &[],
        )
        .await
        .expect("run");

        assert!(matches!(run.verdict, StageVerdict::Complete { .. }));
        assert_eq!(run.turns.len(), 2);
        assert_eq!(run.questions_asked, 1);
        assert!(run.turns[1].prompt.contains("Under tests/integration."));

        let requests = llm.requests.lock().expect("lock");
        // Follow-up replays the first exchange.
        assert_eq!(requests[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_unanswered_questions_end_rounds() {
        let agent = ValidatorAgent::new(AgentProfile::Standard);
        let llm = MockLlmProvider::new(&["QUESTION: Anyone there?"]);
        let config = WorkerConfig::default().with_qa_max_rounds(3);
        let prp = Prp::with_id("7", "t", "c");

        let run = run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &[])
            .await
            .expect("run");
        assert!(matches!(run.verdict, StageVerdict::Incomplete { .. }));
        assert_eq!(llm.request_count(), 1);
    }

    #[tokio::test]
    async fn test_rounds_are_bounded() {
        let agent = ValidatorAgent::new(AgentProfile::Standard);
        let llm = MockLlmProvider::new(&[
            "QUESTION: one?",
            "QUESTION: two?",
            "QUESTION: three?",
            "QUESTION: four?",
        ]);
        let config = WorkerConfig::default().with_qa_max_rounds(2);
        let prp = Prp::with_id("8", "t", "c");

        let run = run_stage(&agent, &llm, &CannedAnswers("no idea"), ctx(&config), &prp, &[])
            .await
            .expect("run");
        assert_eq!(llm.request_count(), 3);
        assert_eq!(run.questions_asked, 2);
    }

    #[tokio::test]
    async fn test_history_is_replayed() {
        let agent = PmAgent::new(AgentProfile::Standard, 80.0);
        let llm = MockLlmProvider::new(&["still working"]);
        let config = WorkerConfig::default();
        let prp = Prp::with_id("9", "t", "c");
        let past = vec![ConversationTurn::new("pm", "earlier prompt", "earlier answer")];

        run_stage(&agent, &llm, &NoQuestions, ctx(&config), &prp, &past)
            .await
            .expect("run");

        let requests = llm.requests.lock().expect("lock");
        assert_eq!(requests[0].messages.len(), 3);
        assert_eq!(requests[0].messages[0].content, "earlier prompt");
        assert!(requests[0].system.as_deref().unwrap_or("").contains("PM agent"));
    }

    #[test]
    fn test_follow_up_prompt() {
        let questions = vec![
            Question::new("1", "pm", "pm-1", "Which DB?"),
            Question::new("1", "pm", "pm-1", "Which region?"),
        ];
        let answers = vec![Some(Answer::new(&questions[0].id, " Postgres 16 ", "m")), None];
        let prompt = follow_up_prompt(&questions, &answers);
        assert!(prompt.contains("Q: Which DB?\nA: Postgres 16\n"));
        assert!(prompt.contains("Q: Which region?\nA: No answer is available."));
    }
}
