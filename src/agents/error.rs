//! Error types for the role agents and their workers.

use thiserror::Error;

use crate::error::LlmError;
use crate::scheduler::QueueError;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Error from the LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Queue protocol error.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Redis command outside the queue protocol failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The claimed PRP vanished while it was being processed.
    #[error("PRP {0} not found")]
    PrpNotFound(String),

    /// Configuration error.
    #[error("Agent configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
