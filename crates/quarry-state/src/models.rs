//! Row models for the state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Work item lifecycle. `failed` returns to `pending` while attempts
/// remain; otherwise it is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Job lifecycle. `dead` is the poison state: attempts exhausted, never
/// auto-retried.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

/// Run lifecycle. Runs are append-only; a completed run is never updated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome reported to `complete` for either queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of an enqueue: duplicates are the expected path on re-runs and
/// never raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    Duplicate,
}

impl EnqueueResult {
    #[must_use]
    pub fn accepted(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued)
    }
}

/// Result of a heartbeat: `Lost` means the lease expired and another
/// worker may already own the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    Ok,
    Lost,
}

/// An ingest queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_item_id: String,
    pub source_system: String,
    pub source_name: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_uri: String,
    pub request_method: String,
    pub request_headers: Option<Value>,
    pub request_body: Option<String>,
    /// Acquisition variant (raw, html, ...); part of the dedupe key when set.
    pub variant: Option<String>,
    pub status: WorkItemStatus,
    pub priority: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub dedupe_key: String,
    pub locked_by: Option<String>,
    pub lock_expires_utc: Option<DateTime<Utc>>,
    pub available_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build a pending work item with defaults. The dedupe key is derived
    /// from the four-tuple natural key plus the optional variant.
    #[must_use]
    pub fn new(
        source_system: impl Into<String>,
        source_name: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let source_system = source_system.into();
        let source_name = source_name.into();
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let dedupe_key = dedupe_key(&source_system, &source_name, &resource_type, &resource_id, None);
        Self {
            work_item_id: quarry_utils::ids::new_id(),
            source_system,
            source_name,
            resource_type,
            resource_id,
            request_uri: request_uri.into(),
            request_method: "GET".to_string(),
            request_headers: None,
            request_body: None,
            variant: None,
            status: WorkItemStatus::Pending,
            priority: 100,
            attempt: 0,
            max_attempts: 3,
            dedupe_key,
            locked_by: None,
            lock_expires_utc: None,
            available_utc: None,
            last_error: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        let variant = variant.into();
        self.dedupe_key = dedupe_key(
            &self.source_system,
            &self.source_name,
            &self.resource_type,
            &self.resource_id,
            Some(&variant),
        );
        self.variant = Some(variant);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// `source_system:source_name:resource_type:resource_id[:variant]`
#[must_use]
pub fn dedupe_key(
    source_system: &str,
    source_name: &str,
    resource_type: &str,
    resource_id: &str,
    variant: Option<&str>,
) -> String {
    match variant {
        Some(v) => format!("{source_system}:{source_name}:{resource_type}:{resource_id}:{v}"),
        None => format!("{source_system}:{source_name}:{resource_type}:{resource_id}"),
    }
}

/// An LLM derivation queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Identifies the prompt/schema contract, versioned (e.g. `entity_facts_v1`).
    pub interrogation_key: String,
    /// Opaque input envelope.
    pub input_json: String,
    pub status: JobStatus,
    pub priority: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub available_utc: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub lock_expires_utc: Option<DateTime<Utc>>,
    pub model_hint: Option<String>,
    pub dedupe_key: Option<String>,
    pub last_error: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Parameters for enqueuing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub interrogation_key: String,
    pub input_json: String,
    pub priority: i64,
    pub max_attempts: i64,
    pub model_hint: Option<String>,
    pub dedupe_key: Option<String>,
}

impl NewJob {
    #[must_use]
    pub fn new(interrogation_key: impl Into<String>, input_json: impl Into<String>) -> Self {
        Self {
            interrogation_key: interrogation_key.into(),
            input_json: input_json.into(),
            priority: 100,
            max_attempts: 3,
            model_hint: None,
            dedupe_key: None,
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub model_name: Option<String>,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub metrics_json: Option<String>,
    pub error: Option<String>,
}

/// A durable output of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub run_id: String,
    pub artifact_type: String,
    pub lake_uri: Option<String>,
    pub content: Option<String>,
    pub content_mime_type: Option<String>,
    pub content_sha256: String,
    pub byte_count: i64,
    pub stored_in_sql: bool,
    pub mirrored_to_lake: bool,
    pub created_utc: DateTime<Utc>,
}

/// Parameters for recording an artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: String,
    pub artifact_type: String,
    pub lake_uri: Option<String>,
    pub content: Option<String>,
    pub content_mime_type: Option<String>,
    pub content_sha256: String,
    pub byte_count: i64,
    pub stored_in_sql: bool,
    pub mirrored_to_lake: bool,
}
