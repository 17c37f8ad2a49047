//! Chat contract types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("unexpected LLM response shape: {reason}")]
    UnexpectedResponse { reason: String },

    #[error("model not available: {model}")]
    ModelUnavailable { model: String },
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

impl ChatOptions {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: Some(0.0),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one chat call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    /// Assistant message content (the text the handler parses).
    pub content: String,
    /// Full provider response, verbatim, for the response artifact.
    pub raw_response: Value,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub done: bool,
    pub error_message: Option<String>,
}

/// Model metadata captured into run metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub digest: Option<String>,
    pub family: Option<String>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

/// A chat endpoint accepting messages plus a JSON output schema.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError>;

    async fn model_info(&self, model: &str) -> Result<ModelInfo, LlmError>;
}
