//! Page classification handler.

use async_trait::async_trait;
use serde_json::json;

use quarry_state::Job;

use crate::context::RunContext;
use crate::handler::{HandlerResult, JobHandler};
use crate::handlers::{JobInput, LlmDerivation};
use crate::prompts::{page_classification_messages, page_classification_schema};

/// Classifies a page into an entity type with confidence and tags. The
/// page title rides in `entity_id`; the excerpt is the bounded evidence.
pub struct PageClassificationHandler {
    derivation: LlmDerivation,
}

impl PageClassificationHandler {
    #[must_use]
    pub fn new(derivation: LlmDerivation) -> Self {
        Self { derivation }
    }
}

#[async_trait]
impl JobHandler for PageClassificationHandler {
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
            return HandlerResult::skipped("no excerpt evidence provided");
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

        let excerpt = LlmDerivation::bundle_text(&bundle);
        let namespace = input.extra_params.namespace.as_deref().unwrap_or("Main");
        let messages = page_classification_messages(
            &input.entity_id,
            namespace,
            &excerpt,
            Some(&input.entity_id),
        );
        let schema = page_classification_schema();

        let (output, raw_response, metrics) = match self
            .derivation
            .derive(job.model_hint.as_deref(), &messages, &schema, ctx)
            .await
        {
            Ok(result) => result,
            Err(failure) => return failure,
        };

        if output.get("primary_type").and_then(|v| v.as_str()).is_none() {
            return HandlerResult::Failed {
                error: "classifier output missing primary_type".to_string(),
                validation_errors: vec![output.to_string()],
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
