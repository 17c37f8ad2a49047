//! Durable state store and job queue.
//!
//! Two queues share one contract: `work_items` (ingest) and `job` (LLM
//! derivation). Enqueue is idempotent through a unique dedupe index; claims
//! are lease-based and crash recovery is nothing more than lease expiry.
//! All mutations are per-row; the database is the only shared mutable
//! state in the system.

pub mod error;
pub mod jobs;
pub mod models;
pub mod store;
pub mod work_items;

pub use error::StateError;
pub use models::{
    ArtifactRecord, EnqueueResult, HeartbeatResult, Job, JobStatus, NewArtifact, NewJob, Run,
    RunStatus, WorkItem, WorkItemStatus, WorkOutcome,
};
pub use store::{BackoffPolicy, StateStore};
