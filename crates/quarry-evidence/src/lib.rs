//! Evidence bundling for LLM runs: deterministic bounding, sampling, and
//! redaction of input text and SQL result sets.
//!
//! The pipeline is bound-then-redact: per-item byte caps, then bundle-level
//! item/byte caps (first-N in input order), then pattern-based redaction.
//! The pre-redaction content hash is preserved for traceability; the
//! redacted bytes are what ships to the model.

pub mod bounding;
pub mod bundle;
pub mod extract;
pub mod policy;
pub mod redaction;

pub use bounding::{bound_bundle, bound_item, BundleBoundingMeta, ItemBoundingMeta};
pub use bundle::{build_bundle, EvidenceBundle, BUNDLE_BUILD_VERSION};
pub use extract::{extract_sql_result_text, SqlExtractionMeta};
pub use policy::{EvidenceItem, EvidencePolicy, SamplingStrategy};
pub use redaction::{create_custom_rule, default_rules, redact, RedactionMeta, RedactionRule};
