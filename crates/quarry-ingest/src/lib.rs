//! Ingestion pipeline: claim work items, fetch through connectors, persist
//! canonical records to the lake, discover follow-up work, and report
//! outcomes back to the queue.

pub mod discovery;
pub mod record;
pub mod runner;
pub mod seeds;

pub use discovery::{DiscoveryPlugin, LinkDiscovery};
pub use record::{
    build_hash_input, verify_content_hash, AcquisitionVariant, ExchangeRecord, IngestRecord,
    Provenance,
};
pub use runner::{IngestError, IngestRunner, RunnerMetrics, RunnerOptions};
pub use seeds::seed_work_items;
