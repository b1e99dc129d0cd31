//! Claude integration.
//!
//! [`LlmProvider`] is the seam workers and the Q&A orchestrator call
//! through; [`AnthropicProvider`] is the Messages API implementation.
//!
//! ```ignore
//! use prp_relay::llm::{AnthropicProvider, GenerationRequest, LlmProvider, Message};
//!
//! let provider = AnthropicProvider::new(api_key)?;
//! let request = GenerationRequest::new("claude-sonnet-4-5", vec![Message::user("Hello")])
//!     .with_max_tokens(256);
//! let response = provider.generate(request).await?;
//! println!("{}", response.text().unwrap_or_default());
//! ```

pub mod anthropic;
pub mod client;

pub use anthropic::AnthropicProvider;
pub use client::{
    GenerationRequest, GenerationResponse, LlmProvider, Message, MessageRole, Usage,
};
