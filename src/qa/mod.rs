//! Q&A: questions agents raise mid-stage, answered by Claude with PRP and
//! workspace file context.

pub mod file_cache;
pub mod orchestrator;
pub mod types;

pub use file_cache::{referenced_paths, CacheStats, CachedFile, ContentHash, FileCache};
pub use orchestrator::{build_prompt, compose_answer, QaConfig, QaError, QaOrchestrator, ANSWER_TTL_SECS};
pub use types::{Answer, Question};
