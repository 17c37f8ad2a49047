//! Entity fact extraction handler.

use async_trait::async_trait;
use serde_json::json;

use quarry_state::Job;

use crate::context::RunContext;
use crate::handler::{HandlerResult, JobHandler};
use crate::handlers::{JobInput, LlmDerivation};
use crate::prompts::{entity_facts_messages, entity_facts_schema};

/// Extracts structured facts about an entity from bounded evidence. Each
/// fact must cite evidence ids present in the bundle; uncited facts fail
/// validation rather than being silently kept.
pub struct EntityFactsHandler {
    derivation: LlmDerivation,
}

impl EntityFactsHandler {
    #[must_use]
    pub fn new(derivation: LlmDerivation) -> Self {
        Self { derivation }
    }
}

#[async_trait]
impl JobHandler for EntityFactsHandler {
    async fn handle(&self, job: &Job, ctx: &RunContext) -> HandlerResult {
        let input = match JobInput::parse(&job.input_json) {
            Ok(input) => input,
            Err(error) => {
                return HandlerResult::Failed {
                    error,
                    validation_errors: Vec::new(),
                }
            }
        };

        if input.extra_params.evidence.is_empty() {
            return HandlerResult::skipped("no evidence provided");
        }

        if ctx.is_dry_run() {
            return self.derivation.dry_run_result(&input, ctx);
        }

        let bundle = match self.derivation.bundle_evidence(&input) {
            Ok(bundle) => bundle,
            Err(errors) => {
                return HandlerResult::Failed {
                    error: "evidence policy validation failed".to_string(),
                    validation_errors: errors,
                }
            }
        };

        let evidence_text = LlmDerivation::bundle_text(&bundle);
        let messages =
            entity_facts_messages(&input.entity_type, &input.entity_id, &evidence_text);
        let schema = entity_facts_schema();

        let (output, raw_response, metrics) = match self
            .derivation
            .derive(job.model_hint.as_deref(), &messages, &schema, ctx)
            .await
        {
            Ok(result) => result,
            Err(failure) => return failure,
        };

        // Every cited evidence id must exist in the bundle.
        let known_ids: Vec<&str> = bundle
            .items
            .iter()
            .map(|item| item.evidence_id.as_str())
            .collect();
        let mut validation_errors = Vec::new();
        if let Some(facts) = output.get("facts").and_then(|v| v.as_array()) {
            for (index, fact) in facts.iter().enumerate() {
                let cited: Vec<&str> = fact
                    .get("evidence_ids")
                    .and_then(|v| v.as_array())
                    .map(|ids| ids.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();
                if cited.is_empty() {
                    validation_errors.push(format!("fact {index} cites no evidence"));
                }
                for id in cited {
                    if !known_ids.contains(&id) {
                        validation_errors
                            .push(format!("fact {index} cites unknown evidence id '{id}'"));
                    }
                }
            }
        } else {
            validation_errors.push("output missing facts array".to_string());
        }

        if !validation_errors.is_empty() {
            return HandlerResult::Failed {
                error: "fact extraction failed output validation".to_string(),
                validation_errors,
            };
        }

        let request_envelope = json!({
            "interrogation_key": job.interrogation_key,
            "input": serde_json::from_str::<serde_json::Value>(&job.input_json)
                .unwrap_or(serde_json::Value::Null),
            "model_hint": job.model_hint,
        });
        let artifacts = self.derivation.success_artifacts(
            request_envelope,
            &messages,
            &bundle,
            raw_response,
            &output,
        );

        HandlerResult::Succeeded {
            output,
            metrics,
            artifacts,
            evidence_bundle: Some(bundle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionMode;
    use quarry_llm::{ChatMessage, ChatOptions, ChatOutcome, LlmClient, LlmError, ModelInfo};
    use quarry_retry::RetryConfig;
    use serde_json::Value;
    use std::sync::Arc;

    struct ScriptedLlm {
        content: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _schema: Option<&Value>,
            _options: &ChatOptions,
        ) -> Result<ChatOutcome, LlmError> {
            Ok(ChatOutcome {
                content: self.content.clone(),
                raw_response: json!({"message": {"content": self.content}}),
                prompt_tokens: Some(10),
                completion_tokens: Some(20),
                total_tokens: Some(30),
                done: true,
                error_message: None,
            })
        }

        async fn model_info(&self, model: &str) -> Result<ModelInfo, LlmError> {
            Ok(ModelInfo {
                model: model.to_string(),
                digest: None,
                family: None,
                parameter_size: None,
                quantization_level: None,
            })
        }
    }

    fn derivation_with(content: &str) -> LlmDerivation {
        let mut derivation = LlmDerivation::new(
            Arc::new(ScriptedLlm {
                content: content.to_string(),
            }),
            "llama3.2",
        );
        derivation.retry = RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        };
        derivation
    }

    fn job_with_evidence() -> Job {
        let mut job = sample_job();
        job.input_json = json!({
            "entity_type": "character",
            "entity_id": "luke",
            "extra_params": {"evidence": [
                {"evidence_id": "e1", "text": "Luke Skywalker was a Jedi born on Tatooine."}
            ]}
        })
        .to_string();
        job
    }

    fn sample_job() -> Job {
        Job {
            job_id: "job-1".to_string(),
            interrogation_key: "entity_facts_v1".to_string(),
            input_json: String::new(),
            status: quarry_state::JobStatus::Running,
            priority: 100,
            attempt_count: 1,
            max_attempts: 3,
            available_utc: chrono::Utc::now(),
            locked_by: Some("w".to_string()),
            lock_expires_utc: None,
            model_hint: None,
            dedupe_key: None,
            last_error: None,
            created_utc: chrono::Utc::now(),
        }
    }

    fn ctx(mode: ExecutionMode) -> RunContext {
        RunContext::create("job-1", "run-1", "w", "entity_facts", 1, 3, mode)
    }

    #[tokio::test]
    async fn valid_output_succeeds_with_artifacts() {
        let output = json!({
            "entity_type": "character",
            "entity_id": "luke",
            "facts": [{"fact": "Luke was a Jedi", "confidence": 0.95, "evidence_ids": ["e1"]}],
            "needs_review": false
        });
        let handler = EntityFactsHandler::new(derivation_with(&output.to_string()));

        let result = handler.handle(&job_with_evidence(), &ctx(ExecutionMode::Live)).await;

        let HandlerResult::Succeeded {
            output, artifacts, evidence_bundle, ..
        } = result
        else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(output["facts"][0]["evidence_ids"][0], "e1");
        assert!(evidence_bundle.is_some());
        let types: Vec<&str> = artifacts.iter().map(|a| a.artifact_type.as_str()).collect();
        for expected in ["request_json", "prompt_text", "evidence_bundle", "response_json", "output_json"] {
            assert!(types.contains(&expected), "missing artifact {expected}");
        }
    }

    #[tokio::test]
    async fn uncited_facts_fail_validation() {
        let output = json!({
            "entity_type": "character",
            "entity_id": "luke",
            "facts": [{"fact": "Unsupported claim", "confidence": 0.9, "evidence_ids": ["bogus"]}],
            "needs_review": false
        });
        let handler = EntityFactsHandler::new(derivation_with(&output.to_string()));

        let result = handler.handle(&job_with_evidence(), &ctx(ExecutionMode::Live)).await;

        let HandlerResult::Failed { validation_errors, .. } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(validation_errors.iter().any(|e| e.contains("bogus")));
    }

    #[tokio::test]
    async fn unparseable_output_fails_with_history() {
        let handler = EntityFactsHandler::new(derivation_with("definitely not json"));

        let result = handler.handle(&job_with_evidence(), &ctx(ExecutionMode::Live)).await;

        let HandlerResult::Failed { error, validation_errors } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(error.contains("schema-parse failure"));
        assert!(!validation_errors.is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_calls_the_model() {
        struct PanickingLlm;

        #[async_trait]
        impl LlmClient for PanickingLlm {
            async fn chat(
                &self,
                _m: &[ChatMessage],
                _s: Option<&Value>,
                _o: &ChatOptions,
            ) -> Result<ChatOutcome, LlmError> {
                panic!("dry-run must not reach the LLM");
            }

            async fn model_info(&self, _m: &str) -> Result<ModelInfo, LlmError> {
                panic!("dry-run must not reach the LLM");
            }
        }

        let handler = EntityFactsHandler::new(LlmDerivation::new(Arc::new(PanickingLlm), "m"));

        let result = handler
            .handle(&job_with_evidence(), &ctx(ExecutionMode::DryRun))
            .await;

        let HandlerResult::Succeeded { output, artifacts, .. } = result else {
            panic!("expected synthetic success, got {result:?}");
        };
        assert_eq!(output["status"], "DRY-RUN");
        // Only the trivial output artifact, SQL-only.
        assert_eq!(artifacts.len(), 1);
        assert!(!artifacts[0].mirrored_to_lake);
    }

    #[tokio::test]
    async fn missing_evidence_skips() {
        let mut job = sample_job();
        job.input_json =
            json!({"entity_type": "character", "entity_id": "luke"}).to_string();
        let handler = EntityFactsHandler::new(derivation_with("{}"));

        let result = handler.handle(&job, &ctx(ExecutionMode::Live)).await;

        assert!(matches!(result, HandlerResult::Skipped { .. }));
    }

    #[tokio::test]
    async fn malformed_envelope_fails() {
        let mut job = sample_job();
        job.input_json = "not an envelope".to_string();
        let handler = EntityFactsHandler::new(derivation_with("{}"));

        let result = handler.handle(&job, &ctx(ExecutionMode::Live)).await;

        assert!(matches!(result, HandlerResult::Failed { .. }));
    }
}
