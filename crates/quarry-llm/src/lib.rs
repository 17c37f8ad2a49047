//! LLM provider abstraction.
//!
//! The dispatcher talks to a chat endpoint through [`LlmClient`]: messages
//! plus a JSON output schema in, content plus token accounting out. Model
//! metadata (digest, family, parameter size, quantization) is fetched
//! separately and lands in the run's metrics.

pub mod extract;
pub mod ollama;
pub mod types;

pub use extract::parse_json_lenient;
pub use ollama::OllamaClient;
pub use types::{
    ChatMessage, ChatOptions, ChatOutcome, ChatRole, LlmClient, LlmError, ModelInfo,
};
