//! The handler contract.

use async_trait::async_trait;
use serde_json::Value;

use quarry_evidence::EvidenceBundle;
use quarry_state::Job;

use crate::context::RunContext;

/// Artifact payload as the handler produced it. The dispatcher decides the
/// bytes (canonical JSON for values) and the extension.
#[derive(Debug, Clone)]
pub enum ArtifactContent {
    Json(Value),
    Text(String),
}

/// One artifact a handler wants persisted, with its storage policy.
/// Large, rarely-read blobs prefer lake-only; small, frequently-joined
/// payloads prefer SQL-only or dual.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub artifact_type: String,
    pub content: ArtifactContent,
    pub stored_in_sql: bool,
    pub mirrored_to_lake: bool,
}

impl ArtifactSpec {
    #[must_use]
    pub fn json_sql_only(artifact_type: impl Into<String>, value: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            content: ArtifactContent::Json(value),
            stored_in_sql: true,
            mirrored_to_lake: false,
        }
    }

    #[must_use]
    pub fn json_lake_only(artifact_type: impl Into<String>, value: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            content: ArtifactContent::Json(value),
            stored_in_sql: false,
            mirrored_to_lake: true,
        }
    }

    #[must_use]
    pub fn json_dual(artifact_type: impl Into<String>, value: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            content: ArtifactContent::Json(value),
            stored_in_sql: true,
            mirrored_to_lake: true,
        }
    }

    #[must_use]
    pub fn text_lake_only(artifact_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            content: ArtifactContent::Text(text.into()),
            stored_in_sql: false,
            mirrored_to_lake: true,
        }
    }
}

/// Tagged outcome of one handler invocation. The arms are mutually
/// exclusive; a skip is not a failure (the job is marked succeeded with
/// the skip as the recorded outcome).
#[derive(Debug)]
pub enum HandlerResult {
    Succeeded {
        output: Value,
        metrics: Value,
        artifacts: Vec<ArtifactSpec>,
        evidence_bundle: Option<EvidenceBundle>,
    },
    Failed {
        error: String,
        validation_errors: Vec<String>,
    },
    Skipped {
        reason: String,
    },
}

impl HandlerResult {
    #[must_use]
    pub fn succeeded(output: Value) -> Self {
        HandlerResult::Succeeded {
            output,
            metrics: Value::Null,
            artifacts: Vec::new(),
            evidence_bundle: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        HandlerResult::Failed {
            error: error.into(),
            validation_errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        HandlerResult::Skipped {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, HandlerResult::Succeeded { .. })
    }
}

/// A job handler. Must be idempotent with respect to lake/SQL writes;
/// after a crash the same job runs again on another worker.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &RunContext) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_pick_the_right_arm() {
        assert!(HandlerResult::succeeded(json!({})).is_succeeded());
        assert!(!HandlerResult::failed("boom").is_succeeded());
        assert!(!HandlerResult::skipped("nothing to do").is_succeeded());
    }

    #[test]
    fn artifact_spec_policies() {
        let sql_only = ArtifactSpec::json_sql_only("request_json", json!({}));
        assert!(sql_only.stored_in_sql && !sql_only.mirrored_to_lake);

        let lake_only = ArtifactSpec::json_lake_only("response_json", json!({}));
        assert!(!lake_only.stored_in_sql && lake_only.mirrored_to_lake);

        let dual = ArtifactSpec::json_dual("output_json", json!({}));
        assert!(dual.stored_in_sql && dual.mirrored_to_lake);
    }
}
