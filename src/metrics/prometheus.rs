//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by prp-relay and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all prp-relay metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage attempts, labeled by role and outcome
/// (promoted, complete, requeued, failed, released).
pub static PRPS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Time spent on one stage attempt in seconds, labeled by role.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Length of a stage list, labeled by queue and list (pending, inflight,
/// dead_letter).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Total LLM API requests, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs touched by the watchdog, labeled by queue and outcome.
pub static WATCHDOG_RECOVERIES: OnceLock<CounterVec> = OnceLock::new();

/// Questions handled by the Q&A orchestrator, labeled by status.
pub static QA_ANSWERS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent tasks restarted by the supervisor, labeled by task name.
pub static AGENT_RESTARTS: OnceLock<CounterVec> = OnceLock::new();

/// Number of running agent tasks.
pub static ACTIVE_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later
/// calls leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Stage metrics
    let prps_processed = CounterVec::new(
        Opts::new("prp_relay_prps_processed_total", "Stage attempts by outcome"),
        &["role", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "prp_relay_stage_duration_seconds",
            "Duration of one stage attempt in seconds",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["role"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("prp_relay_queue_depth", "Length of a stage list"),
        &["queue", "list"],
    )?;

    // LLM metrics
    let llm_requests_total = CounterVec::new(
        Opts::new("prp_relay_llm_requests_total", "Total LLM API requests"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new(
            "prp_relay_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("prp_relay_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    // Recovery and supervision
    let watchdog_recoveries = CounterVec::new(
        Opts::new(
            "prp_relay_watchdog_recoveries_total",
            "Inflight jobs handled by the watchdog",
        ),
        &["queue", "outcome"],
    )?;

    let qa_answers_total = CounterVec::new(
        Opts::new("prp_relay_qa_answers_total", "Questions handled"),
        &["status"],
    )?;

    let agent_restarts = CounterVec::new(
        Opts::new("prp_relay_agent_restarts_total", "Agent task restarts"),
        &["task"],
    )?;

    let active_agents = Gauge::new("prp_relay_active_agents", "Number of running agent tasks")?;

    registry.register(Box::new(prps_processed.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(watchdog_recoveries.clone()))?;
    registry.register(Box::new(qa_answers_total.clone()))?;
    registry.register(Box::new(agent_restarts.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = PRPS_PROCESSED.set(prps_processed);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = WATCHDOG_RECOVERIES.set(watchdog_recoveries);
    let _ = QA_ANSWERS_TOTAL.set(qa_answers_total);
    let _ = AGENT_RESTARTS.set(agent_restarts);
    let _ = ACTIVE_AGENTS.set(active_agents);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge
                .with_label_values(&["pm_queue", "pending"])
                .set(4.0);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("prp_relay_queue_depth"));
    }
}
