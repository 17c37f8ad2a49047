//! Ollama chat backend.

use serde_json::{json, Value};
use tracing::debug;

use async_trait::async_trait;

use crate::types::{ChatMessage, ChatOptions, ChatOutcome, LlmClient, LlmError, ModelInfo};

/// Client for a local Ollama server (`/api/chat`, `/api/show`).
///
/// Structured output is requested through the `format` field, which Ollama
/// constrains generation against; temperature 0 keeps runs reproducible.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
        options: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let mut body = json!({
            "model": options.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(schema) = output_schema {
            body["format"] = schema.clone();
        }
        if let Some(temperature) = options.temperature {
            body["options"] = json!({"temperature": temperature});
        }

        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %options.model, url = %url, "calling chat endpoint");

        let response = self
            .client
            .post(&url)
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout {
                        seconds: options.timeout.as_secs(),
                    }
                } else {
                    LlmError::Transport(err)
                }
            })?;

        if response.status().as_u16() == 404 {
            return Err(LlmError::ModelUnavailable {
                model: options.model.clone(),
            });
        }

        let raw: Value = response.json().await?;

        let content = raw
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string);

        let error_message = raw
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);

        let content = match (content, &error_message) {
            (Some(c), _) => c,
            (None, Some(_)) => String::new(),
            (None, None) => {
                return Err(LlmError::UnexpectedResponse {
                    reason: "response has neither message.content nor error".to_string(),
                });
            }
        };

        let prompt_tokens = raw.get("prompt_eval_count").and_then(Value::as_u64);
        let completion_tokens = raw.get("eval_count").and_then(Value::as_u64);
        let total_tokens = match (prompt_tokens, completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        };

        Ok(ChatOutcome {
            content,
            done: raw.get("done").and_then(Value::as_bool).unwrap_or(false),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            error_message,
            raw_response: raw,
        })
    }

    async fn model_info(&self, model: &str) -> Result<ModelInfo, LlmError> {
        let url = format!("{}/api/show", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"name": model}))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Err(LlmError::ModelUnavailable {
                model: model.to_string(),
            });
        }

        let raw: Value = response.json().await?;
        let details = raw.get("details").cloned().unwrap_or(Value::Null);

        let get = |value: &Value, key: &str| {
            value.get(key).and_then(Value::as_str).map(str::to_string)
        };

        Ok(ModelInfo {
            model: model.to_string(),
            digest: get(&raw, "digest").or_else(|| get(&details, "digest")),
            family: get(&details, "family"),
            parameter_size: get(&details, "parameter_size"),
            quantization_level: get(&details, "quantization_level"),
        })
    }
}
