//! Prometheus-based metrics.
//!
//! Call [`init_metrics`] once at startup, record through a
//! [`MetricsCollector`], and render with [`export_metrics`].

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_AGENTS, AGENT_RESTARTS, LLM_LATENCY, LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL,
    PRPS_PROCESSED, QA_ANSWERS_TOTAL, QUEUE_DEPTH, REGISTRY, STAGE_DURATION, WATCHDOG_RECOVERIES,
};
