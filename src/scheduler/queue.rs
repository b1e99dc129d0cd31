//! Redis-backed stage queue with reliable dequeue and atomic promotion.
//!
//! # Queue Structure
//!
//! Each stage uses three Redis lists:
//!
//! - `{queue}`: pending PRP ids, pushed on the left, claimed from the right
//! - `{queue}:inflight`: ids currently held by a worker
//! - `{queue}:dead_letter`: ids of PRPs that exhausted their retries
//!
//! # Reliability
//!
//! `claim` moves an id into the inflight list with a single `BLMOVE`, so a
//! crash never loses a job between "popped" and "held". Every later state
//! change (promotion, requeue, failure) is one Lua script, and each script
//! removes the id from its destination before pushing it.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use super::job::{ClaimedJob, RetryPolicy};
use super::scripts;
use super::stage::Stage;
use crate::evidence::Evidence;
use crate::prp::{field, keys, Prp, PrpError};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed, including errors raised by the scripts.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The PRP hash could not be read.
    #[error("Invalid PRP: {0}")]
    InvalidPrp(#[from] PrpError),

    /// A PRP with this id already exists.
    #[error("PRP {0} already exists")]
    AlreadyExists(String),

    /// A script returned a reply this client does not understand.
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),
}

impl QueueError {
    /// Whether the connection itself failed, as opposed to one command.
    pub fn is_connection_level(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) => true,
            QueueError::RedisError(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Result of one `claim` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A job is now held by the caller.
    Claimed(ClaimedJob),
    /// The queue stayed empty for the whole timeout.
    Empty,
    /// The PRP hash no longer exists; the id was dropped.
    Orphaned(String),
    /// The PRP is already complete or failed; the id was dropped.
    Terminal(String),
}

/// Result of `promote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Pushed onto the next stage's queue.
    Promoted { next: Stage },
    /// Last stage finished; the PRP is `complete`.
    Complete,
}

/// Result of `requeue`, `release` and `expire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back on the queue for another attempt.
    Requeued { retry_count: u32 },
    /// Retries exhausted; `state=failed`, id on the dead-letter list.
    Failed { retry_count: u32 },
    /// The PRP hash no longer exists; the id was dropped everywhere.
    Orphaned,
    /// The id was not in the inflight list; nothing changed.
    NotInflight,
    /// `expire` only: the claim is younger than the cutoff; nothing changed.
    Fresh,
}

impl RequeueOutcome {
    fn from_reply(reply: (String, i64)) -> Result<Self, QueueError> {
        let (outcome, count) = reply;
        let retry_count = count.max(0) as u32;
        match outcome.as_str() {
            "requeued" => Ok(RequeueOutcome::Requeued { retry_count }),
            "failed" => Ok(RequeueOutcome::Failed { retry_count }),
            "orphaned" => Ok(RequeueOutcome::Orphaned),
            "not_inflight" => Ok(RequeueOutcome::NotInflight),
            "fresh" => Ok(RequeueOutcome::Fresh),
            other => Err(QueueError::UnexpectedReply(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueOutcome::Requeued { .. } => "requeued",
            RequeueOutcome::Failed { .. } => "failed",
            RequeueOutcome::Orphaned => "orphaned",
            RequeueOutcome::NotInflight => "not_inflight",
            RequeueOutcome::Fresh => "fresh",
        }
    }
}

/// Depth of one stage's lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub inflight: usize,
    pub dead_letter: usize,
}

/// Queue of one pipeline stage.
///
/// Blocking commands occupy the underlying multiplexed connection, so a
/// consumer that calls [`claim`](Self::claim) should own its queue
/// (created with [`connect`](Self::connect)) rather than share one.
pub struct StageQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    stage: Stage,
    inflight: String,
    dead_letter: String,
    policy: RetryPolicy,
}

impl StageQueue {
    /// Connects to Redis with a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        stage: Stage,
        policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let redis = connect_manager(redis_url).await?;
        Ok(Self::from_connection(redis, stage, policy))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Fine for components that never block on the connection.
    pub fn from_connection(redis: ConnectionManager, stage: Stage, policy: RetryPolicy) -> Self {
        Self {
            redis,
            stage,
            inflight: keys::inflight_key(stage.queue()),
            dead_letter: keys::dead_letter_key(stage.queue()),
            policy,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn name(&self) -> &'static str {
        self.stage.queue()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// A clone of the connection for auxiliary commands (history, status).
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Writes a new PRP hash and enqueues its id.
    ///
    /// Hash write, de-duplication and push run as one `MULTI` block.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyExists` if `prp:<id>` is present.
    pub async fn submit(&self, prp: &Prp) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let key = keys::prp_key(&prp.id);

        let exists: bool = conn.exists(&key).await?;
        if exists {
            return Err(QueueError::AlreadyExists(prp.id.clone()));
        }

        let fields = prp.to_hash_fields();
        redis::pipe()
            .atomic()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .lrem(self.name(), 0, &prp.id)
            .ignore()
            .lpush(self.name(), &prp.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        tracing::info!(prp_id = %prp.id, queue = %self.name(), "PRP submitted");
        Ok(())
    }

    /// Waits up to `timeout` for a job and claims it for `worker_id`.
    ///
    /// `BLMOVE <queue> <queue>:inflight RIGHT LEFT` relocates the id in one
    /// command; `claim.lua` then stamps processing metadata and the working
    /// state.
    pub async fn claim(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<ClaimOutcome, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1);

        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(self.name())
            .arg(&self.inflight)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(prp_id) = moved else {
            return Ok(ClaimOutcome::Empty);
        };

        let now = chrono::Utc::now().timestamp();
        let reply: String = scripts::CLAIM
            .key(&self.inflight)
            .key(keys::prp_key(&prp_id))
            .arg(&prp_id)
            .arg(worker_id)
            .arg(self.name())
            .arg(self.stage.working_state().as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "claimed" => Ok(ClaimOutcome::Claimed(ClaimedJob {
                prp_id,
                queue: self.name().to_string(),
                worker_id: worker_id.to_string(),
                claimed_at: now,
            })),
            "orphaned" => {
                tracing::warn!(prp_id = %prp_id, queue = %self.name(), "Dropped id without PRP hash");
                Ok(ClaimOutcome::Orphaned(prp_id))
            }
            "terminal" => {
                tracing::warn!(prp_id = %prp_id, queue = %self.name(), "Dropped id of finished PRP");
                Ok(ClaimOutcome::Terminal(prp_id))
            }
            other => Err(QueueError::UnexpectedReply(other.to_string())),
        }
    }

    /// Loads the PRP hash, `None` if it does not exist.
    pub async fn load_prp(&self, prp_id: &str) -> Result<Option<Prp>, QueueError> {
        let mut conn = self.redis.clone();
        let hash: std::collections::HashMap<String, String> =
            conn.hgetall(keys::prp_key(prp_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(Prp::from_hash(hash)?))
    }

    /// Completes the stage for a held job.
    ///
    /// `promote.lua` removes the id from inflight, writes `evidence` plus
    /// `<role>_completed_at/_by`, clears processing metadata, sets the next
    /// state and pushes onto the next queue, all atomically. Evidence keys
    /// that name pipeline-owned fields are not written.
    ///
    /// # Errors
    ///
    /// A script error (job no longer inflight, hash missing) surfaces as
    /// `QueueError::RedisError`; the hash is left untouched in that case.
    pub async fn promote(
        &self,
        job: &ClaimedJob,
        evidence: &Evidence,
    ) -> Result<PromoteOutcome, QueueError> {
        let mut conn = self.redis.clone();
        let now = chrono::Utc::now().timestamp();

        let mut invocation = scripts::PROMOTE.prepare_invoke();
        invocation
            .key(&self.inflight)
            .key(keys::prp_key(&job.prp_id))
            .arg(self.stage.next_queue().unwrap_or(""))
            .arg(self.stage.role())
            .arg(self.stage.next_state().as_str())
            .arg(&job.worker_id)
            .arg(now);
        for (name, value) in writable_fields(&job.prp_id, evidence) {
            invocation.arg(name).arg(value);
        }

        let reply: String = invocation.invoke_async(&mut conn).await?;
        match (reply.as_str(), self.stage.next()) {
            ("promoted", Some(next)) => Ok(PromoteOutcome::Promoted { next }),
            ("complete", None) => Ok(PromoteOutcome::Complete),
            (other, _) => Err(QueueError::UnexpectedReply(other.to_string())),
        }
    }

    /// Returns a held job to the queue, counting a failed attempt.
    ///
    /// Once the count reaches the policy's limit the PRP is failed and
    /// dead-lettered instead.
    pub async fn requeue(&self, prp_id: &str, reason: &str) -> Result<RequeueOutcome, QueueError> {
        self.run_requeue(prp_id, reason, true, None).await
    }

    /// Returns a held job without counting an attempt.
    pub async fn release(&self, prp_id: &str, reason: &str) -> Result<RequeueOutcome, QueueError> {
        self.run_requeue(prp_id, reason, false, None).await
    }

    /// Requeues a held job only if its claim was stamped at or before
    /// `cutoff` (unix seconds). Counts a failed attempt.
    pub async fn expire(
        &self,
        prp_id: &str,
        reason: &str,
        cutoff: i64,
    ) -> Result<RequeueOutcome, QueueError> {
        self.run_requeue(prp_id, reason, true, Some(cutoff)).await
    }

    async fn run_requeue(
        &self,
        prp_id: &str,
        reason: &str,
        count_attempt: bool,
        cutoff: Option<i64>,
    ) -> Result<RequeueOutcome, QueueError> {
        let mut conn = self.redis.clone();
        let now = chrono::Utc::now().timestamp();

        let reply: (String, i64) = scripts::REQUEUE
            .key(&self.inflight)
            .key(self.name())
            .key(keys::prp_key(prp_id))
            .key(&self.dead_letter)
            .arg(prp_id)
            .arg(reason)
            .arg(self.policy.max_retries)
            .arg(now)
            .arg(if count_attempt { "1" } else { "0" })
            .arg(cutoff.map(|c| c.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        let outcome = RequeueOutcome::from_reply(reply)?;
        match outcome {
            RequeueOutcome::Failed { retry_count } => {
                tracing::warn!(
                    prp_id = %prp_id,
                    queue = %self.name(),
                    retry_count = retry_count,
                    reason = %reason,
                    "PRP failed after exhausting retries"
                );
            }
            RequeueOutcome::Requeued { retry_count } => {
                tracing::info!(
                    prp_id = %prp_id,
                    queue = %self.name(),
                    retry_count = retry_count,
                    remaining = self.policy.remaining(retry_count),
                    reason = %reason,
                    "PRP requeued"
                );
            }
            _ => {
                tracing::debug!(prp_id = %prp_id, outcome = outcome.as_str(), "Requeue had no effect");
            }
        }
        Ok(outcome)
    }

    /// Stamps `processing_started_at` if it is missing.
    ///
    /// Returns `true` if the field was written.
    pub async fn stamp_missing_start(&self, prp_id: &str, now: i64) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let key = keys::prp_key(prp_id);
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(false);
        }
        let written: bool = conn
            .hset_nx(&key, field::PROCESSING_STARTED_AT, now)
            .await?;
        Ok(written)
    }

    /// Writes partial evidence onto the PRP hash without moving it.
    ///
    /// Does nothing if the hash is gone.
    pub async fn record_evidence(&self, prp_id: &str, evidence: &Evidence) -> Result<(), QueueError> {
        let fields = writable_fields(prp_id, evidence);
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let key = keys::prp_key(prp_id);
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(());
        }
        conn.hset_multiple::<_, _, _, ()>(&key, fields.as_slice())
            .await?;
        Ok(())
    }

    /// Ids currently held, newest claim first.
    pub async fn inflight_ids(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.lrange(&self.inflight, 0, -1).await?;
        Ok(ids)
    }

    /// Up to `limit` dead-lettered ids, most recent first.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .lrange(&self.dead_letter, 0, limit as isize - 1)
            .await?;
        Ok(ids)
    }

    /// Depth of the queue, inflight and dead-letter lists.
    pub async fn depths(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, inflight, dead_letter): (usize, usize, usize) = redis::pipe()
            .llen(self.name())
            .llen(&self.inflight)
            .llen(&self.dead_letter)
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            pending,
            inflight,
            dead_letter,
        })
    }
}

/// Evidence as hash fields, minus the ones the pipeline owns.
fn writable_fields(prp_id: &str, evidence: &Evidence) -> Vec<(String, String)> {
    evidence
        .to_hash_fields()
        .into_iter()
        .filter(|(name, _)| {
            let reserved = field::is_reserved(name);
            if reserved {
                tracing::debug!(prp_id = %prp_id, field = %name, "Ignoring reserved evidence field");
            }
            !reserved
        })
        .collect()
}

/// Opens a new ConnectionManager.
pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
}
