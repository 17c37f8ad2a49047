//! Per-run correlation context handed to handlers, read-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Live vs dry-run. Dry-run is the staging safety mechanism: handlers
/// perform no external side effects and return a synthetic success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    DryRun,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Live => "live",
            ExecutionMode::DryRun => "dry_run",
        }
    }
}

/// Correlation context for one run of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub job_id: String,
    pub run_id: String,
    /// `{job_id}-{run_id}`; appears on every log line of the run.
    pub correlation_id: String,
    pub worker_id: String,
    pub job_type: String,
    pub attempt_number: i64,
    pub max_attempts: i64,
    pub execution_mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn create(
        job_id: impl Into<String>,
        run_id: impl Into<String>,
        worker_id: impl Into<String>,
        job_type: impl Into<String>,
        attempt_number: i64,
        max_attempts: i64,
        execution_mode: ExecutionMode,
    ) -> Self {
        let job_id = job_id.into();
        let run_id = run_id.into();
        let correlation_id = quarry_utils::ids::correlation_id(&job_id, &run_id);
        Self {
            job_id,
            run_id,
            correlation_id,
            worker_id: worker_id.into(),
            job_type: job_type.into(),
            attempt_number,
            max_attempts,
            execution_mode,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.execution_mode == ExecutionMode::DryRun
    }

    /// Correlation fields for structured log lines.
    #[must_use]
    pub fn log_context(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "run_id": self.run_id,
            "correlation_id": self.correlation_id,
            "worker_id": self.worker_id,
            "job_type": self.job_type,
            "attempt": self.attempt_number,
            "execution_mode": self.execution_mode.as_str(),
        })
    }

    /// Span carrying the correlation fields.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        quarry_utils::logging::run_span(
            &self.job_id,
            &self.run_id,
            &self.correlation_id,
            &self.worker_id,
            self.execution_mode.as_str(),
        )
    }
}
