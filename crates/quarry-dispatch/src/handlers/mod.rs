//! Built-in job handlers.
//!
//! Both handlers share the same derivation shape: parse the input
//! envelope, bound and redact the evidence, build prompt messages, drive
//! the LLM under bounded retries, and declare artifacts. In dry-run mode
//! the LLM is never called and only a trivial output artifact is recorded.

pub mod entity_facts;
pub mod page_classification;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use quarry_evidence::{build_bundle, EvidenceBundle, EvidenceItem, EvidencePolicy};
use quarry_llm::{parse_json_lenient, ChatMessage, ChatOptions, LlmClient};
use quarry_retry::{retry_with_backoff, RetryClass, RetryConfig};

use crate::context::RunContext;
use crate::handler::{ArtifactSpec, HandlerResult};
use crate::prompts::PROMPT_VERSION;

/// One evidence item in the job input envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceInput {
    pub evidence_id: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    pub text: String,
}

/// The opaque `input_json` envelope both built-in interrogations accept.
#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub source_refs: Vec<Value>,
    #[serde(default)]
    pub extra_params: ExtraParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraParams {
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl JobInput {
    /// Parse the envelope; a malformed envelope is a handler-contract
    /// error, terminal by definition.
    pub fn parse(input_json: &str) -> Result<Self, String> {
        serde_json::from_str(input_json).map_err(|e| format!("invalid input envelope: {e}"))
    }
}

/// Shared LLM backend wiring for the built-in handlers.
pub struct LlmDerivation {
    pub llm: Arc<dyn LlmClient>,
    pub default_model: String,
    pub evidence_policy: EvidencePolicy,
    pub retry: RetryConfig,
    pub call_timeout: Duration,
}

impl LlmDerivation {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, default_model: impl Into<String>) -> Self {
        Self {
            llm,
            default_model: default_model.into(),
            evidence_policy: EvidencePolicy::default(),
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(300),
        }
    }

    /// Assemble the evidence bundle for the envelope's evidence items.
    pub fn bundle_evidence(&self, input: &JobInput) -> Result<EvidenceBundle, Vec<String>> {
        let items: Vec<EvidenceItem> = input
            .extra_params
            .evidence
            .iter()
            .map(|e| {
                let mut item = EvidenceItem::inline(e.evidence_id.clone(), e.text.clone());
                if let Some(uri) = &e.source_uri {
                    item.source_ref = json!({"source_uri": uri});
                }
                item
            })
            .collect();
        build_bundle(items, &self.evidence_policy, None)
    }

    /// The text handed to the prompt: bounded, redacted item contents in
    /// bundle order.
    #[must_use]
    pub fn bundle_text(bundle: &EvidenceBundle) -> String {
        bundle
            .items
            .iter()
            .map(|item| format!("[{}] {}", item.evidence_id, item.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Drive the chat call plus JSON extraction under bounded retries.
    /// Transport and parse failures both count as retryable attempts; the
    /// error history travels back in the failure arm.
    pub async fn derive(
        &self,
        job_model_hint: Option<&str>,
        messages: &[ChatMessage],
        schema: &Value,
        ctx: &RunContext,
    ) -> Result<(Value, Value, Value), HandlerResult> {
        let model = job_model_hint.unwrap_or(&self.default_model).to_string();
        let mut options = ChatOptions::new(model.clone());
        options.timeout = self.call_timeout;

        let outcome = retry_with_backoff(
            || async {
                let chat = self
                    .llm
                    .chat(messages, Some(schema), &options)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(error) = &chat.error_message {
                    return Err(format!("provider error: {error}"));
                }
                let (parsed, parse_errors) = parse_json_lenient(&chat.content, true);
                match parsed {
                    Some(value) => Ok((value, chat)),
                    None => Err(format!(
                        "schema-parse failure: {}",
                        parse_errors.join("; ")
                    )),
                }
            },
            &self.retry,
            |_err: &String| RetryClass::Retryable,
            "llm_derivation",
        )
        .await;

        match outcome.result {
            Ok((parsed, chat)) => {
                info!(
                    correlation_id = %ctx.correlation_id,
                    attempts = outcome.attempts,
                    total_tokens = chat.total_tokens,
                    "derivation complete"
                );
                // Model metadata (digest, family, size, quantization) rides
                // in the run metrics; failure to fetch it is not a failure
                // of the run.
                let model_info = self
                    .llm
                    .model_info(&model)
                    .await
                    .ok()
                    .and_then(|info| serde_json::to_value(info).ok());
                let metrics = json!({
                    "model": model,
                    "model_info": model_info,
                    "prompt_version": PROMPT_VERSION,
                    "prompt_tokens": chat.prompt_tokens,
                    "completion_tokens": chat.completion_tokens,
                    "total_tokens": chat.total_tokens,
                    "llm_attempts": outcome.attempts,
                });
                Ok((parsed, chat.raw_response, metrics))
            }
            Err(error) => {
                warn!(correlation_id = %ctx.correlation_id, error = %error, "derivation failed");
                Err(HandlerResult::Failed {
                    error,
                    validation_errors: outcome.error_history,
                })
            }
        }
    }

    /// The synthetic result every handler returns in dry-run mode: no LLM
    /// call, no non-trivial artifacts.
    #[must_use]
    pub fn dry_run_result(&self, input: &JobInput, ctx: &RunContext) -> HandlerResult {
        let output = json!({
            "status": "DRY-RUN",
            "note": "dry_run",
            "entity_type": input.entity_type,
            "entity_id": input.entity_id,
            "evidence_items": input.extra_params.evidence.len(),
        });
        HandlerResult::Succeeded {
            metrics: json!({"execution_mode": ctx.execution_mode.as_str()}),
            artifacts: vec![ArtifactSpec::json_sql_only("output_json", output.clone())],
            evidence_bundle: None,
            output,
        }
    }

    /// The artifact set shared by successful live runs.
    pub fn success_artifacts(
        &self,
        request_envelope: Value,
        messages: &[ChatMessage],
        bundle: &EvidenceBundle,
        raw_response: Value,
        output: &Value,
    ) -> Vec<ArtifactSpec> {
        let prompt_text = messages
            .iter()
            .map(|m| format!("--- {:?} ---\n{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let bundle_value = serde_json::to_value(bundle).unwrap_or(Value::Null);

        vec![
            ArtifactSpec::json_sql_only("request_json", request_envelope),
            ArtifactSpec::text_lake_only("prompt_text", prompt_text),
            ArtifactSpec::json_lake_only("evidence_bundle", bundle_value),
            ArtifactSpec::json_lake_only("response_json", raw_response),
            ArtifactSpec::json_dual("output_json", output.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_evidence() {
        let input = JobInput::parse(
            r#"{
                "entity_type": "character",
                "entity_id": "luke",
                "source_refs": [],
                "extra_params": {"evidence": [
                    {"evidence_id": "e1", "source_uri": "cli_input", "text": "Luke was a Jedi."}
                ]}
            }"#,
        )
        .unwrap();

        assert_eq!(input.entity_type, "character");
        assert_eq!(input.extra_params.evidence.len(), 1);
        assert_eq!(input.extra_params.evidence[0].evidence_id, "e1");
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(JobInput::parse("not json").is_err());
        assert!(JobInput::parse(r#"{"entity_type": "x"}"#).is_err());
    }

    #[test]
    fn missing_extra_params_defaults_empty() {
        let input =
            JobInput::parse(r#"{"entity_type": "planet", "entity_id": "tatooine"}"#).unwrap();
        assert!(input.extra_params.evidence.is_empty());
        assert!(input.source_refs.is_empty());
    }
}
