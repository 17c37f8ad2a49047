//! Opaque identifier helpers.

use uuid::Uuid;

/// New random 128-bit identifier, lowercase hyphenated.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Correlation id pairing a job with one of its runs.
#[must_use]
pub fn correlation_id(job_id: &str, run_id: &str) -> String {
    format!("{job_id}-{run_id}")
}
