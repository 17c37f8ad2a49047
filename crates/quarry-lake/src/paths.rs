//! Deterministic lake path derivation.
//!
//! Paths are pure functions of record identity and date. The same record
//! written twice lands at the same path, which is the other half of the
//! idempotency story (the first half being digest comparison).

use camino::Utf8PathBuf;
use chrono::NaiveDate;

/// Path for an ingest record, relative to the lake base:
/// `<kind>/<source_system>/<source_name>/<resource_type>/YYYY/MM/DD/<id>.<ext>`
#[must_use]
pub fn ingest_record_path(
    kind: &str,
    source_system: &str,
    source_name: &str,
    resource_type: &str,
    date: NaiveDate,
    record_id: &str,
    ext: &str,
) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "{kind}/{source_system}/{source_name}/{resource_type}/{}/{record_id}.{ext}",
        date.format("%Y/%m/%d")
    ))
}

/// Path for an LLM run artifact, relative to the lake base:
/// `llm_runs/YYYY/MM/DD/<run_id>/<artifact_type>.<ext>`
#[must_use]
pub fn llm_artifact_path(
    date: NaiveDate,
    run_id: &str,
    artifact_type: &str,
    ext: &str,
) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "llm_runs/{}/{run_id}/{artifact_type}.{ext}",
        date.format("%Y/%m/%d")
    ))
}
