//! Integration tests against a real Redis.
//!
//! Tests flush the selected database, so point them at a scratch one.
//! Run with: REDIS_URL=redis://127.0.0.1:6379/15 cargo test --test pipeline_redis -- --ignored

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use prp_relay::agents::{build_agent, AgentWorker, NoQuestions, QuestionChannel, RedisQuestionChannel, WorkerConfig};
use prp_relay::evidence::Evidence;
use prp_relay::llm::{GenerationRequest, GenerationResponse, LlmProvider, Usage};
use prp_relay::prp::{field, keys, status, AgentState, AgentStatus};
use prp_relay::qa::{Question, QaOrchestrator};
use prp_relay::scheduler::{
    connect_manager, ClaimOutcome, PromoteOutcome, QueueError, RequeueOutcome, RetryPolicy, Stage,
    StageQueue, Watchdog,
};
use prp_relay::{LlmError, Prp, PrpState, Settings};

/// Tests share queue names; run them one at a time.
static SERIAL: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(|| tokio::sync::Mutex::new(()));

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
}

async fn fresh_db() -> ConnectionManager {
    let mut conn = connect_manager(&redis_url()).await.expect("redis should be reachable");
    redis::cmd("FLUSHDB")
        .query_async::<_, ()>(&mut conn)
        .await
        .expect("flushdb");
    conn
}

fn queue(conn: &ConnectionManager, stage: Stage) -> StageQueue {
    StageQueue::from_connection(conn.clone(), stage, RetryPolicy::new(3))
}

async fn claim(queue: &StageQueue) -> prp_relay::scheduler::ClaimedJob {
    match queue.claim("test-worker", Duration::from_secs(1)).await.expect("claim") {
        ClaimOutcome::Claimed(job) => job,
        other => panic!("expected a claim, got {:?}", other),
    }
}

async fn hash(conn: &mut ConnectionManager, id: &str) -> HashMap<String, String> {
    conn.hgetall(keys::prp_key(id)).await.expect("hgetall")
}

async fn list(conn: &mut ConnectionManager, key: &str) -> Vec<String> {
    conn.lrange(key, 0, -1).await.expect("lrange")
}

fn evidence(pairs: &[(&str, serde_json::Value)]) -> Evidence {
    let mut ev = Evidence::new();
    for (k, v) in pairs {
        ev.insert(*k, v.clone());
    }
    ev
}

#[tokio::test]
#[ignore]
async fn test_prp_travels_all_stages() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let prp = Prp::with_id("flow-1", "Login", "OAuth login");

    let pm = queue(&conn, Stage::Pm);
    pm.submit(&prp).await.expect("submit");
    assert_eq!(list(&mut conn, "pm_queue").await, vec!["flow-1"]);

    let job = claim(&pm).await;
    let h = hash(&mut conn, "flow-1").await;
    assert_eq!(h["state"], "dev");
    assert_eq!(h[field::PROCESSING_WORKER], "test-worker");
    assert_eq!(list(&mut conn, "pm_queue:inflight").await, vec!["flow-1"]);

    let outcome = pm
        .promote(&job, &evidence(&[("tests_passed", serde_json::json!(true)), ("state", serde_json::json!("complete"))]))
        .await
        .expect("promote");
    assert_eq!(outcome, PromoteOutcome::Promoted { next: Stage::Validation });

    let h = hash(&mut conn, "flow-1").await;
    assert_eq!(h["state"], "validation");
    assert_eq!(h["tests_passed"], "true");
    assert_eq!(h["pm_completed_by"], "test-worker");
    assert_eq!(h["retry_count"], "0");
    assert!(!h.contains_key(field::PROCESSING_STARTED_AT));
    assert!(list(&mut conn, "pm_queue:inflight").await.is_empty());
    assert_eq!(list(&mut conn, "validation_queue").await, vec!["flow-1"]);

    let validation = queue(&conn, Stage::Validation);
    let job = claim(&validation).await;
    validation.promote(&job, &Evidence::new()).await.expect("promote");

    let integration = queue(&conn, Stage::Integration);
    let job = claim(&integration).await;
    let outcome = integration
        .promote(&job, &evidence(&[("deployed", serde_json::json!(true))]))
        .await
        .expect("promote");
    assert_eq!(outcome, PromoteOutcome::Complete);

    let h = hash(&mut conn, "flow-1").await;
    assert_eq!(h["state"], "complete");
    for key in ["pm_queue", "validation_queue", "integration_queue", "integration_queue:inflight"] {
        assert!(list(&mut conn, key).await.is_empty(), "{} not empty", key);
    }
}

#[tokio::test]
#[ignore]
async fn test_duplicate_submit_rejected() {
    let _guard = SERIAL.lock().await;
    let conn = fresh_db().await;
    let pm = queue(&conn, Stage::Pm);
    let prp = Prp::with_id("dup-1", "t", "c");

    pm.submit(&prp).await.expect("first submit");
    let err = pm.submit(&prp).await.expect_err("second submit");
    assert!(matches!(err, QueueError::AlreadyExists(id) if id == "dup-1"));
    assert_eq!(pm.depths().await.expect("depths").pending, 1);
}

#[tokio::test]
#[ignore]
async fn test_retries_exhaust_into_dead_letter() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let pm = queue(&conn, Stage::Pm);
    pm.submit(&Prp::with_id("retry-1", "t", "c")).await.expect("submit");

    for attempt in 1..=2 {
        claim(&pm).await;
        let outcome = pm.requeue("retry-1", "incomplete evidence: tests_passed").await.expect("requeue");
        assert_eq!(outcome, RequeueOutcome::Requeued { retry_count: attempt });
        assert_eq!(list(&mut conn, "pm_queue").await, vec!["retry-1"]);
        assert!(list(&mut conn, "pm_queue:inflight").await.is_empty());
    }

    claim(&pm).await;
    let outcome = pm.requeue("retry-1", "incomplete evidence: tests_passed").await.expect("requeue");
    assert_eq!(outcome, RequeueOutcome::Failed { retry_count: 3 });

    let h = hash(&mut conn, "retry-1").await;
    assert_eq!(h["state"], "failed");
    assert_eq!(h[field::FAILURE_REASON], "incomplete evidence: tests_passed");
    assert!(list(&mut conn, "pm_queue").await.is_empty());
    assert!(list(&mut conn, "pm_queue:inflight").await.is_empty());
    assert_eq!(pm.peek_dead_letter(10).await.expect("dead letter"), vec!["retry-1"]);
}

#[tokio::test]
#[ignore]
async fn test_release_does_not_count_attempt() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let pm = queue(&conn, Stage::Pm);
    pm.submit(&Prp::with_id("rel-1", "t", "c")).await.expect("submit");

    claim(&pm).await;
    let outcome = pm.release("rel-1", "llm unavailable").await.expect("release");
    assert_eq!(outcome, RequeueOutcome::Requeued { retry_count: 0 });
    assert_eq!(hash(&mut conn, "rel-1").await[field::LAST_ERROR], "llm unavailable");

    // A second settle of the same job finds nothing inflight.
    assert_eq!(pm.requeue("rel-1", "late").await.expect("requeue"), RequeueOutcome::NotInflight);
}

#[tokio::test]
#[ignore]
async fn test_claim_drops_finished_and_orphaned_ids() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let pm = queue(&conn, Stage::Pm);

    let mut done = Prp::with_id("done-1", "t", "c");
    done.state = PrpState::Complete;
    conn.hset_multiple::<_, _, _, ()>(keys::prp_key("done-1"), done.to_hash_fields().as_slice())
        .await
        .expect("hset");
    conn.lpush::<_, _, ()>("pm_queue", "done-1").await.expect("lpush");
    conn.lpush::<_, _, ()>("pm_queue", "ghost-1").await.expect("lpush");

    let first = pm.claim("w", Duration::from_secs(1)).await.expect("claim");
    assert_eq!(first, ClaimOutcome::Terminal("done-1".to_string()));
    let second = pm.claim("w", Duration::from_secs(1)).await.expect("claim");
    assert_eq!(second, ClaimOutcome::Orphaned("ghost-1".to_string()));
    assert!(list(&mut conn, "pm_queue:inflight").await.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_watchdog_recovers_only_expired_jobs() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default()
        .with_redis_url(redis_url())
        .with_inflight_timeout(Duration::from_secs(600));
    let pm = queue(&conn, Stage::Pm);

    pm.submit(&Prp::with_id("old-1", "t", "c")).await.expect("submit");
    pm.submit(&Prp::with_id("young-1", "t", "c")).await.expect("submit");
    claim(&pm).await;
    claim(&pm).await;

    let long_ago = chrono::Utc::now().timestamp() - 3600;
    conn.hset::<_, _, _, ()>(keys::prp_key("old-1"), field::PROCESSING_STARTED_AT, long_ago)
        .await
        .expect("hset");

    let report = Watchdog::new(conn.clone(), &settings).sweep().await.expect("sweep");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.recovered, 1);

    assert_eq!(list(&mut conn, "pm_queue").await, vec!["old-1"]);
    assert_eq!(list(&mut conn, "pm_queue:inflight").await, vec!["young-1"]);
    let h = hash(&mut conn, "old-1").await;
    assert_eq!(h["retry_count"], "1");
    assert!(h[field::LAST_ERROR].starts_with("inflight timeout after"));
}

#[tokio::test]
#[ignore]
async fn test_watchdog_stamps_and_releases_orphans() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default().with_redis_url(redis_url());
    let pm = queue(&conn, Stage::Pm);

    // Crash between BLMOVE and claim stamp.
    pm.submit(&Prp::with_id("unstamped-1", "t", "c")).await.expect("submit");
    redis::cmd("LMOVE")
        .arg("pm_queue")
        .arg("pm_queue:inflight")
        .arg("RIGHT")
        .arg("LEFT")
        .query_async::<_, Option<String>>(&mut conn)
        .await
        .expect("lmove");
    // Hash deleted while inflight.
    conn.lpush::<_, _, ()>("pm_queue:inflight", "gone-1").await.expect("lpush");

    let report = Watchdog::new(conn.clone(), &settings).sweep().await.expect("sweep");
    assert_eq!(report.stamped, 1);
    assert_eq!(report.orphans, 1);
    assert!(hash(&mut conn, "unstamped-1").await.contains_key(field::PROCESSING_STARTED_AT));
    assert_eq!(list(&mut conn, "pm_queue:inflight").await, vec!["unstamped-1"]);
}

/// Always answers with the same text.
struct MockLlmProvider {
    response: Mutex<String>,
}

impl MockLlmProvider {
    fn new(response: &str) -> Self {
        Self {
            response: Mutex::new(response.to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let content = self.response.lock().expect("lock").clone();
        Ok(GenerationResponse {
            id: "msg_mock".to_string(),
            model: "mock-model".to_string(),
            content: vec![content],
            stop_reason: Some("end_turn".to_string()),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
        })
    }
}

#[tokio::test]
#[ignore]
async fn test_worker_promotes_with_mock_claude() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default().with_redis_url(redis_url());

    queue(&conn, Stage::Pm)
        .submit(&Prp::with_id("work-1", "Login", "OAuth login"))
        .await
        .expect("submit");

    let llm: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new(
        "Done.\n```json\n{\"tests_passed\": true, \"coverage_pct\": 91}\n```",
    ));
    let worker_conn = connect_manager(&redis_url()).await.expect("connect");
    let worker = AgentWorker::new(
        "pm-it",
        build_agent(Stage::Pm, &settings),
        llm,
        queue(&worker_conn, Stage::Pm),
        Arc::new(NoQuestions),
        WorkerConfig::from_settings(&settings),
    );
    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(worker.run(rx));

    let mut state = String::new();
    for _ in 0..50 {
        state = hash(&mut conn, "work-1").await.get("state").cloned().unwrap_or_default();
        if state == "validation" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tx.send(()).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("worker should stop")
        .expect("worker should not panic");

    assert_eq!(state, "validation");
    let h = hash(&mut conn, "work-1").await;
    assert_eq!(h["coverage_pct"], "91");
    let history = list(&mut conn, &keys::history_key("work-1", "pm")).await;
    assert_eq!(history.len(), 1);
    let agent: HashMap<String, String> = conn.hgetall(keys::agent_key("pm-it")).await.expect("agent");
    assert_eq!(agent["status"], "stopped");
    assert_eq!(agent["processed"], "1");
}

#[tokio::test]
#[ignore]
async fn test_qa_round_trip() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let workspace = tempfile::TempDir::new().expect("tempdir");
    std::fs::write(workspace.path().join("billing.rs"), "pub const TEST_KEY: &str = \"sk_test\";")
        .expect("write");
    let settings = Settings::default()
        .with_redis_url(redis_url())
        .with_workspace_root(workspace.path());
    queue(&conn, Stage::Pm)
        .submit(&Prp::with_id("qa-1", "Checkout", "Stripe checkout"))
        .await
        .expect("submit");

    let qa_conn = connect_manager(&redis_url()).await.expect("connect");
    let orchestrator = QaOrchestrator::new(
        qa_conn,
        Arc::new(MockLlmProvider::new("Use the Stripe test keys.")),
        &settings,
    );

    let files = orchestrator.file_cache().expect("workspace root exists");
    assert!(files.context_for("see billing.rs", 1_000).contains("TEST_KEY"));

    let asker_conn = connect_manager(&redis_url()).await.expect("connect");
    let channel = RedisQuestionChannel::new(asker_conn, Duration::from_secs(5));
    let question = Question::new("qa-1", "pm", "pm-it", "Which API keys does billing.rs use?");
    let ask = tokio::spawn({
        let question = question.clone();
        async move { channel.ask(&[question]).await }
    });

    let mut handled = false;
    for _ in 0..5 {
        if orchestrator.process_next().await.expect("process") {
            handled = true;
            break;
        }
    }
    assert!(handled);

    let answers = ask.await.expect("join").expect("ask");
    let answer = answers[0].as_ref().expect("answered");
    assert_eq!(answer.question_id, question.id);
    assert_eq!(answer.answer, "Use the Stripe test keys.");

    assert!(list(&mut conn, "qa_queue:inflight").await.is_empty());
    let qa_history = list(&mut conn, &keys::history_key("qa-1", "qa")).await;
    assert_eq!(qa_history.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_qa_recovers_inflight_and_drops_garbage() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default().with_redis_url(redis_url());

    let question = Question::new("qa-2", "validator", "validator-it", "Where are the tests?");
    let payload = serde_json::to_string(&question).expect("json");
    conn.lpush::<_, _, ()>("qa_queue:inflight", &payload).await.expect("lpush");
    conn.lpush::<_, _, ()>("qa_queue:inflight", "not json").await.expect("lpush");

    let orchestrator = QaOrchestrator::new(
        connect_manager(&redis_url()).await.expect("connect"),
        Arc::new(MockLlmProvider::new("Under tests/.")),
        &settings,
    );
    assert_eq!(orchestrator.recover_inflight().await.expect("recover"), 2);
    assert!(list(&mut conn, "qa_queue:inflight").await.is_empty());

    // Oldest first: the question, then the garbage entry.
    assert!(orchestrator.process_next().await.expect("process"));
    assert!(orchestrator.process_next().await.expect("process"));
    assert!(list(&mut conn, "qa_queue").await.is_empty());
    assert!(list(&mut conn, "qa_queue:inflight").await.is_empty());

    let ttl: i64 = conn.ttl(keys::answer_key(&question.id)).await.expect("ttl");
    assert!(ttl > 0 && ttl <= 3600, "ttl {}", ttl);
}

#[tokio::test]
#[ignore]
async fn test_watchdog_skips_unreadable_entries() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default()
        .with_redis_url(redis_url())
        .with_inflight_timeout(Duration::from_secs(600));
    let pm = queue(&conn, Stage::Pm);
    let integration = queue(&conn, Stage::Integration);

    // An abandoned job in the last stage's inflight list.
    pm.submit(&Prp::with_id("late-1", "t", "c")).await.expect("submit");
    redis::cmd("LMOVE")
        .arg("pm_queue")
        .arg("integration_queue")
        .arg("RIGHT")
        .arg("LEFT")
        .query_async::<_, Option<String>>(&mut conn)
        .await
        .expect("lmove");
    claim(&integration).await;

    pm.submit(&Prp::with_id("early-1", "t", "c")).await.expect("submit");
    claim(&pm).await;

    let long_ago = chrono::Utc::now().timestamp() - 3600;
    for id in ["late-1", "early-1"] {
        conn.hset::<_, _, _, ()>(keys::prp_key(id), field::PROCESSING_STARTED_AT, long_ago)
            .await
            .expect("hset");
    }

    // A PRP key of the wrong type and a history key of the wrong type.
    conn.set::<_, _, ()>(keys::prp_key("bad-1"), "not a hash").await.expect("set");
    conn.lpush::<_, _, ()>("pm_queue:inflight", "bad-1").await.expect("lpush");
    conn.set::<_, _, ()>(keys::history_key("bad-2", "pm"), "not a list")
        .await
        .expect("set");

    let report = Watchdog::new(conn.clone(), &settings).sweep().await.expect("sweep");
    assert_eq!(report.scanned, 3);
    assert_eq!(report.recovered, 2);
    assert_eq!(report.errors, 2);

    assert_eq!(list(&mut conn, "pm_queue").await, vec!["early-1"]);
    assert_eq!(list(&mut conn, "integration_queue").await, vec!["late-1"]);
    assert_eq!(list(&mut conn, "pm_queue:inflight").await, vec!["bad-1"]);
}

/// Corrupts the PRP hash while the stage runs, so the promote script
/// rejects it, then asks the worker to stop after this job.
struct CorruptingLlmProvider {
    conn: ConnectionManager,
    prp_id: String,
    stop: broadcast::Sender<()>,
}

#[async_trait]
impl LlmProvider for CorruptingLlmProvider {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(keys::prp_key(&self.prp_id), field::ID)
            .await
            .expect("hdel");
        let _ = self.stop.send(());
        Ok(GenerationResponse {
            id: "msg_mock".to_string(),
            model: "mock-model".to_string(),
            content: vec!["```json\n{\"tests_passed\": true, \"coverage_pct\": 95}\n```".to_string()],
            stop_reason: Some("end_turn".to_string()),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
        })
    }
}

#[tokio::test]
#[ignore]
async fn test_worker_requeues_when_promote_fails() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let settings = Settings::default().with_redis_url(redis_url());

    queue(&conn, Stage::Pm)
        .submit(&Prp::with_id("broken-1", "Login", "OAuth login"))
        .await
        .expect("submit");

    let (tx, rx) = broadcast::channel(1);
    let llm: Arc<dyn LlmProvider> = Arc::new(CorruptingLlmProvider {
        conn: conn.clone(),
        prp_id: "broken-1".to_string(),
        stop: tx,
    });
    let worker_conn = connect_manager(&redis_url()).await.expect("connect");
    let worker = AgentWorker::new(
        "pm-broken",
        build_agent(Stage::Pm, &settings),
        llm,
        queue(&worker_conn, Stage::Pm),
        Arc::new(NoQuestions),
        WorkerConfig::from_settings(&settings),
    );
    tokio::time::timeout(Duration::from_secs(10), worker.run(rx))
        .await
        .expect("worker should stop after one job");

    let h = hash(&mut conn, "broken-1").await;
    assert!(
        h[field::LAST_ERROR].starts_with("promote failed:"),
        "last_error: {}",
        h[field::LAST_ERROR]
    );
    assert_eq!(h["retry_count"], "1");
    assert_eq!(h["state"], "dev");

    let pending = list(&mut conn, "pm_queue").await;
    let inflight = list(&mut conn, "pm_queue:inflight").await;
    assert_eq!(pending, vec!["broken-1"]);
    assert!(inflight.is_empty(), "inflight: {:?}", inflight);
    assert!(list(&mut conn, "validation_queue").await.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_agent_registry_prunes_abandoned_entries() {
    let _guard = SERIAL.lock().await;
    let mut conn = fresh_db().await;
    let now = chrono::Utc::now().timestamp();

    let mut alive = AgentStatus::new("pm-alive", "pm");
    alive.state = AgentState::Idle;
    let mut dead = AgentStatus::new("pm-killed", "pm");
    dead.state = AgentState::Processing;
    dead.last_activity = now - 7_200;
    status::write(&mut conn, &alive).await.expect("write");
    status::write(&mut conn, &dead).await.expect("write");
    // Registered id whose hash has gone.
    conn.sadd::<_, _, ()>(keys::AGENTS_SET, "pm-ghost").await.expect("sadd");

    let removed = status::prune(&mut conn, now, Duration::from_secs(3_600))
        .await
        .expect("prune");
    assert_eq!(removed, vec!["pm-ghost".to_string(), "pm-killed".to_string()]);

    let agents = status::read_all(&mut conn).await.expect("read");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, "pm-alive");
    let exists: bool = conn.exists(keys::agent_key("pm-killed")).await.expect("exists");
    assert!(!exists);

    status::remove(&mut conn, "pm-alive").await.expect("remove");
    assert!(status::read_all(&mut conn).await.expect("read").is_empty());
}
