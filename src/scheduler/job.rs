//! Claimed jobs and the retry policy applied to them.

use std::fmt;

/// Maximum number of attempts before a PRP is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A PRP id held in a stage's inflight list by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub prp_id: String,
    /// Queue the job was claimed from.
    pub queue: String,
    pub worker_id: String,
    /// Unix seconds at which the claim was stamped.
    pub claimed_at: i64,
}

impl ClaimedJob {
    /// Seconds the job has been held at `now`.
    pub fn held_for(&self, now: i64) -> i64 {
        (now - self.claimed_at).max(0)
    }
}

impl fmt::Display for ClaimedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.prp_id, self.queue)
    }
}

/// Bounded retries. `requeue.lua` fails a PRP once its counted attempts
/// reach `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Attempts left after `retry_count` failures.
    pub fn remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}
