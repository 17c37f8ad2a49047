//! quarry - a durable work-orchestration runtime.
//!
//! Two cooperating pipelines over one core: an ingestion pipeline that
//! crawls upstream sources into a content-addressed data lake plus a SQL
//! state store, and an LLM derivation pipeline that consumes that data and
//! persists structured artifacts with full provenance. Both dispatch
//! durable jobs from a persistent queue through idempotent side effects,
//! with at-least-once execution, deduplication, and lease-based recovery.

pub mod cli;

pub use quarry_chunk as chunk;
pub use quarry_config as config;
pub use quarry_connector as connector;
pub use quarry_dispatch as dispatch;
pub use quarry_evidence as evidence;
pub use quarry_ingest as ingest;
pub use quarry_lake as lake;
pub use quarry_llm as llm;
pub use quarry_retry as retry;
pub use quarry_state as state;
pub use quarry_utils as utils;
