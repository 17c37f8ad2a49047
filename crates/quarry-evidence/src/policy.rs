//! Evidence policy and validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Floor below which a per-item cap is considered a misconfiguration.
pub const MIN_ITEM_BYTES: usize = 256;
/// Floor below which a bundle cap is considered a misconfiguration.
pub const MIN_TOTAL_BYTES: usize = 1024;

/// Row sampling strategy for tabular evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    FirstOnly,
    FirstLast,
    Stride,
}

impl SamplingStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::FirstOnly => "first_only",
            SamplingStrategy::FirstLast => "first_last",
            SamplingStrategy::Stride => "stride",
        }
    }
}

impl FromStr for SamplingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_only" => Ok(SamplingStrategy::FirstOnly),
            "first_last" => Ok(SamplingStrategy::FirstLast),
            "stride" => Ok(SamplingStrategy::Stride),
            other => Err(format!(
                "invalid sampling_strategy '{other}' (expected first_only, first_last, or stride)"
            )),
        }
    }
}

/// Bounding policy applied when assembling an evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePolicy {
    pub max_items: usize,
    pub max_item_bytes: usize,
    pub max_total_bytes: usize,
    pub sampling_strategy: SamplingStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub enable_redaction: bool,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_item_bytes: 16 * 1024,
            max_total_bytes: 256 * 1024,
            sampling_strategy: SamplingStrategy::FirstOnly,
            chunk_size: 2000,
            chunk_overlap: 200,
            enable_redaction: true,
        }
    }
}

impl EvidencePolicy {
    /// Validate the policy, collecting every problem rather than stopping
    /// at the first.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_items == 0 {
            errors.push("max_items must be at least 1".to_string());
        }
        if self.max_item_bytes < MIN_ITEM_BYTES {
            errors.push(format!(
                "max_item_bytes must be at least {MIN_ITEM_BYTES} (got {})",
                self.max_item_bytes
            ));
        }
        if self.max_total_bytes < MIN_TOTAL_BYTES {
            errors.push(format!(
                "max_total_bytes must be at least {MIN_TOTAL_BYTES} (got {})",
                self.max_total_bytes
            ));
        }
        if self.max_item_bytes > self.max_total_bytes {
            errors.push(format!(
                "max_item_bytes ({}) may not exceed max_total_bytes ({})",
                self.max_item_bytes, self.max_total_bytes
            ));
        }
        if self.chunk_size == 0 {
            errors.push("chunk_size must be positive".to_string());
        } else if self.chunk_overlap >= self.chunk_size {
            errors.push(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            ));
        }

        errors
    }
}

/// One piece of evidence attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub evidence_type: String,
    pub source_ref: Value,
    pub content: String,
    pub content_sha256: String,
    pub byte_count: usize,
}

impl EvidenceItem {
    /// Build an inline-text item, computing the hash and byte count.
    #[must_use]
    pub fn inline(evidence_id: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let content_sha256 = quarry_utils::canonical::sha256_hex(content.as_bytes());
        let byte_count = content.len();
        Self {
            evidence_id: evidence_id.into(),
            evidence_type: "inline_text".to_string(),
            source_ref: Value::Null,
            content,
            content_sha256,
            byte_count,
        }
    }
}
