//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_AGENTS, AGENT_RESTARTS, LLM_LATENCY, LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL,
    PRPS_PROCESSED, QA_ANSWERS_TOTAL, QUEUE_DEPTH, STAGE_DURATION, WATCHDOG_RECOVERIES,
};
use crate::llm::Usage;
use crate::scheduler::QueueStats;

/// Metrics collector for recording pipeline metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one stage attempt.
    pub fn record_stage(&self, role: &str, outcome: &str, duration_secs: f64) {
        if let Some(processed) = PRPS_PROCESSED.get() {
            processed.with_label_values(&[role, outcome]).inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[role]).observe(duration_secs);
        }

        tracing::trace!(
            role = role,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record an LLM API request.
    pub fn record_llm_request(&self, model: &str, success: bool, latency_secs: f64, usage: Usage) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = LLM_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[model, status]).inc();
        }

        if let Some(latency) = LLM_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        if let Some(tokens) = LLM_TOKENS_TOTAL.get() {
            tokens
                .with_label_values(&[model, "input"])
                .inc_by(f64::from(usage.input_tokens));
            tokens
                .with_label_values(&[model, "output"])
                .inc_by(f64::from(usage.output_tokens));
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Recorded LLM request metric"
        );
    }

    /// Update the depth gauges of one queue.
    pub fn set_queue_depth(&self, queue: &str, stats: &QueueStats) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth
                .with_label_values(&[queue, "pending"])
                .set(stats.pending as f64);
            depth
                .with_label_values(&[queue, "inflight"])
                .set(stats.inflight as f64);
            depth
                .with_label_values(&[queue, "dead_letter"])
                .set(stats.dead_letter as f64);
        }
    }

    /// Record a job the watchdog requeued or failed.
    pub fn record_watchdog(&self, queue: &str, outcome: &str) {
        if let Some(recoveries) = WATCHDOG_RECOVERIES.get() {
            recoveries.with_label_values(&[queue, outcome]).inc();
        }
    }

    /// Record one question handled by the Q&A orchestrator.
    pub fn record_qa_answer(&self, success: bool) {
        let status = if success { "answered" } else { "failed" };
        if let Some(answers) = QA_ANSWERS_TOTAL.get() {
            answers.with_label_values(&[status]).inc();
        }
    }

    /// Record a supervisor restart of `task`.
    pub fn record_restart(&self, task: &str) {
        if let Some(restarts) = AGENT_RESTARTS.get() {
            restarts.with_label_values(&[task]).inc();
        }
    }

    /// Set the number of running agent tasks.
    pub fn set_active_agents(&self, count: usize) {
        if let Some(active) = ACTIVE_AGENTS.get() {
            active.set(count as f64);
        }
    }
}
