//! prp-relay: a Redis-queued multi-agent delivery pipeline.
//!
//! Product Requirement Prompts (PRPs) move through three stage queues,
//! each consumed by a Claude-backed agent:
//!
//! ```text
//! pm_queue -> validation_queue -> integration_queue -> complete
//! ```
//!
//! Jobs are claimed with `BLMOVE` into per-queue inflight lists and
//! settled by Lua scripts, so a job is never lost or duplicated. A
//! watchdog recovers jobs whose worker died, and a Q&A orchestrator
//! answers questions agents raise mid-stage.

pub mod agents;
pub mod cli;
pub mod config;
pub mod error;
pub mod evidence;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod prp;
pub mod qa;
pub mod scheduler;
pub mod utils;

pub use config::{AgentProfile, ConfigError, Settings};
pub use error::LlmError;
pub use prp::{Prp, PrpState};
