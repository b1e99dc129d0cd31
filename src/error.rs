//! Error types shared across prp-relay subsystems.
//!
//! Subsystem-specific errors live next to the code that raises them
//! (`QueueError` in the scheduler, `ConfigError` in config, `AgentError`
//! in agents, `QaError` in the Q&A orchestrator). This module holds the
//! errors produced by the LLM integration, which every consumer shares.

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: ANTHROPIC_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// The request never got an HTTP response. `transient` is decided from
    /// the transport error itself (connect failure or timeout).
    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API overloaded: {0}")]
    Overloaded(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty completion: model returned no text content")]
    EmptyCompletion,
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport { transient, .. } => *transient,
            LlmError::RateLimited(_) | LlmError::Overloaded(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}
