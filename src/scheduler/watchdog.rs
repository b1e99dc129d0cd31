//! Timeout recovery for abandoned inflight jobs.
//!
//! The watchdog is the pipeline's only liveness mechanism: there are no
//! heartbeats or leases. A job whose claim is older than the inflight
//! timeout is assumed abandoned and requeued with its retry count
//! incremented.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::broadcast;

use super::job::RetryPolicy;
use super::queue::{QueueError, RequeueOutcome, StageQueue};
use super::stage::Stage;
use crate::config::Settings;
use crate::metrics::MetricsCollector;
use crate::prp::{field, history, keys, PrpState};

/// Whether a claim stamped at `started_at` has outlived `timeout` at `now`.
///
/// Strictly greater: a job exactly `timeout` old is left alone.
pub fn is_expired(started_at: i64, now: i64, timeout: Duration) -> bool {
    now.saturating_sub(started_at) > timeout.as_secs() as i64
}

/// Latest `processing_started_at` a job may carry and still be expired.
fn expiry_cutoff(now: i64, timeout: Duration) -> i64 {
    now - timeout.as_secs() as i64 - 1
}

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Inflight entries examined.
    pub scanned: usize,
    /// Expired jobs put back on their queue.
    pub recovered: usize,
    /// Expired jobs that ran out of retries.
    pub failed: usize,
    /// Jobs without a claim timestamp that were stamped.
    pub stamped: usize,
    /// Inflight ids whose PRP hash no longer exists.
    pub orphans: usize,
    /// History lists deleted by age-based cleanup.
    pub histories_pruned: usize,
    /// Jobs, queues or history keys skipped after a Redis error.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.recovered == 0
            && self.failed == 0
            && self.stamped == 0
            && self.orphans == 0
            && self.histories_pruned == 0
            && self.errors == 0
    }
}

/// Periodic sweeper over every stage's inflight list.
pub struct Watchdog {
    redis: ConnectionManager,
    queues: Vec<StageQueue>,
    inflight_timeout: Duration,
    history_retention: Duration,
    interval: Duration,
    metrics: MetricsCollector,
}

impl Watchdog {
    /// Creates a watchdog sharing one connection across all stages.
    ///
    /// The watchdog never blocks on the connection.
    pub fn new(redis: ConnectionManager, settings: &Settings) -> Self {
        let policy = RetryPolicy::new(settings.max_retries);
        let queues = Stage::ALL
            .into_iter()
            .map(|stage| StageQueue::from_connection(redis.clone(), stage, policy))
            .collect();
        Self {
            redis,
            queues,
            inflight_timeout: settings.inflight_timeout,
            history_retention: settings.history_retention,
            interval: settings.watchdog_interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs sweeps every interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.inflight_timeout.as_secs(),
            "Watchdog started"
        );

        loop {
            match self.sweep().await {
                Ok(report) if report.is_quiet() => {
                    tracing::debug!(scanned = report.scanned, "Watchdog sweep found nothing to do");
                }
                Ok(report) => {
                    tracing::info!(
                        scanned = report.scanned,
                        recovered = report.recovered,
                        failed = report.failed,
                        stamped = report.stamped,
                        orphans = report.orphans,
                        histories_pruned = report.histories_pruned,
                        errors = report.errors,
                        "Watchdog sweep complete"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Watchdog sweep failed");
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Watchdog stopped");
    }

    /// One pass over every inflight list followed by history cleanup.
    ///
    /// A bad entry is logged, counted in `errors` and skipped. Only
    /// connection-level failures end the sweep early.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();
        let now = chrono::Utc::now().timestamp();

        for queue in &self.queues {
            if let Err(e) = self.sweep_queue(queue, now, &mut report).await {
                if e.is_connection_level() {
                    return Err(e);
                }
                tracing::warn!(queue = %queue.name(), error = %e, "Skipping unreadable inflight list");
                report.errors += 1;
            }
        }

        match self.prune_histories(now, &mut report).await {
            Err(e) if e.is_connection_level() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "History cleanup failed");
                report.errors += 1;
            }
            Ok(()) => {}
        }
        Ok(report)
    }

    async fn sweep_queue(
        &self,
        queue: &StageQueue,
        now: i64,
        report: &mut SweepReport,
    ) -> Result<(), QueueError> {
        for prp_id in queue.inflight_ids().await? {
            report.scanned += 1;
            if let Err(e) = self.sweep_job(queue, &prp_id, now, report).await {
                if e.is_connection_level() {
                    return Err(e);
                }
                tracing::warn!(
                    prp_id = %prp_id,
                    queue = %queue.name(),
                    error = %e,
                    "Skipping inflight job after Redis error"
                );
                report.errors += 1;
            }
        }
        Ok(())
    }

    async fn sweep_job(
        &self,
        queue: &StageQueue,
        prp_id: &str,
        now: i64,
        report: &mut SweepReport,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let started: Option<String> = conn
            .hget(keys::prp_key(prp_id), field::PROCESSING_STARTED_AT)
            .await?;

        let Some(started_at) = started.and_then(|s| s.trim().parse::<i64>().ok()) else {
            let exists: bool = conn.exists(keys::prp_key(prp_id)).await?;
            if !exists {
                if queue.release(prp_id, "missing PRP hash").await? == RequeueOutcome::Orphaned {
                    report.orphans += 1;
                }
            } else if queue.stamp_missing_start(prp_id, now).await? {
                // Crash between BLMOVE and the claim stamp: start the clock now.
                tracing::warn!(prp_id = %prp_id, queue = %queue.name(), "Stamped inflight job without claim time");
                report.stamped += 1;
            }
            return Ok(());
        };

        if !is_expired(started_at, now, self.inflight_timeout) {
            return Ok(());
        }

        let age = now - started_at;
        let reason = format!("inflight timeout after {}s", age);
        let cutoff = expiry_cutoff(now, self.inflight_timeout);
        let outcome = queue.expire(prp_id, &reason, cutoff).await?;
        match outcome {
            RequeueOutcome::Requeued { .. } => report.recovered += 1,
            RequeueOutcome::Failed { .. } => report.failed += 1,
            RequeueOutcome::Orphaned => report.orphans += 1,
            RequeueOutcome::NotInflight | RequeueOutcome::Fresh => return Ok(()),
        }
        self.metrics.record_watchdog(queue.name(), outcome.as_str());
        tracing::warn!(
            prp_id = %prp_id,
            queue = %queue.name(),
            age_secs = age,
            outcome = outcome.as_str(),
            "Recovered abandoned inflight job"
        );

        Ok(())
    }

    /// Deletes history lists of terminal (or deleted) PRPs whose newest
    /// turn is older than the retention period.
    async fn prune_histories(&self, now: i64, report: &mut SweepReport) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let retention_cutoff = now - self.history_retention.as_secs() as i64;

        let mut history_keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> =
                conn.scan_match(keys::HISTORY_PATTERN).await?;
            while let Some(key) = iter.next_item().await {
                history_keys.push(key);
            }
        }

        for key in history_keys {
            match self.prune_history(&mut conn, &key, retention_cutoff).await {
                Ok(true) => {
                    report.histories_pruned += 1;
                    tracing::debug!(key = %key, "Pruned conversation history");
                }
                Ok(false) => {}
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable history");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Deletes one history list if it is due. Returns whether it was deleted.
    async fn prune_history(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        retention_cutoff: i64,
    ) -> Result<bool, QueueError> {
        let Some((prp_id, _role)) = keys::parse_history_key(key) else {
            return Ok(false);
        };

        let newest: Option<String> = conn.lindex(key, -1).await?;
        let newest_ts = newest.as_deref().and_then(history::newest_timestamp);
        if !is_history_stale(newest_ts, retention_cutoff) {
            return Ok(false);
        }

        let state: Option<String> = conn.hget(keys::prp_key(prp_id), field::STATE).await?;
        let prp_done = match state {
            None => true,
            Some(s) => s.parse::<PrpState>().map(|s| s.is_terminal()).unwrap_or(false),
        };
        if !prp_done {
            return Ok(false);
        }

        conn.del::<_, ()>(key).await?;
        Ok(true)
    }
}

/// A history whose newest entry has no readable timestamp counts as stale.
fn is_history_stale(newest_ts: Option<i64>, retention_cutoff: i64) -> bool {
    newest_ts.map_or(true, |ts| ts < retention_cutoff)
}
