//! Evidence bundle assembly.
//!
//! An evidence bundle is the durable record of exactly what text was put in
//! front of the model: bounded, sampled, redacted, and hashed. The content
//! hash is computed over the pre-redaction canonical form; the redacted
//! form gets its own hash so both are auditable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use quarry_utils::canonical::{canonicalize, canonicalize_serialize, sha256_hex, CANON_VERSION};

use crate::bounding::{bound_bundle, bound_item, ItemBoundingMeta};
use crate::policy::{EvidenceItem, EvidencePolicy};
use crate::redaction::{redact, RedactionRecord, RedactionRule};

/// Bundle format revision, stored with every bundle.
pub const BUNDLE_BUILD_VERSION: &str = "2.0";

/// One item as it appears inside a finished bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledItem {
    pub evidence_id: String,
    pub evidence_type: String,
    pub source_ref: Value,
    /// The content that ships to the model (bounded, then redacted).
    pub content: String,
    /// Hash of the item's original, pre-bounding content.
    pub content_sha256: String,
    pub byte_count: usize,
    pub bounding: ItemBoundingMeta,
    pub redaction_count: usize,
}

/// A fully assembled evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub bundle_id: String,
    pub build_version: String,
    pub policy: Value,
    pub summary: Value,
    pub items: Vec<BundledItem>,
    /// Hash of the canonical pre-redaction item list. Preserved even when
    /// redaction rewrites the stored content, for traceability.
    pub content_sha256: String,
    /// Hash of the canonical redacted item list, when redaction ran.
    pub content_sha256_redacted: Option<String>,
    pub redactions: Vec<RedactionRecord>,
}

impl EvidenceBundle {
    /// Canonical JSON of the bundle, suitable for lake or SQL storage.
    pub fn to_bundle_json(&self) -> Result<String, quarry_utils::error::CanonicalError> {
        canonicalize_serialize(self)
    }
}

fn items_digest(items: &[(String, String)]) -> Result<String, quarry_utils::error::CanonicalError> {
    // (evidence_id, content) pairs in bundle order.
    let value = Value::Array(
        items
            .iter()
            .map(|(id, content)| json!({"evidence_id": id, "content": content}))
            .collect(),
    );
    Ok(sha256_hex(canonicalize(&value)?.as_bytes()))
}

/// Assemble a bundle from raw items under `policy`. Policy validation
/// errors are returned together; nothing is partially built.
pub fn build_bundle(
    items: Vec<EvidenceItem>,
    policy: &EvidencePolicy,
    custom_rules: Option<&[RedactionRule]>,
) -> Result<EvidenceBundle, Vec<String>> {
    let errors = policy.validate();
    if !errors.is_empty() {
        return Err(errors);
    }

    let input_bytes: usize = items.iter().map(|i| i.byte_count).sum();

    // Per-item bound, keeping the original hash for traceability.
    let mut bounded_items = Vec::with_capacity(items.len());
    for item in items {
        let (content, meta) = bound_item(&item.content, policy.max_item_bytes);
        bounded_items.push((item, content, meta));
    }

    // Bundle bound operates on the bounded sizes.
    let rebuilt: Vec<EvidenceItem> = bounded_items
        .iter()
        .map(|(item, content, _)| EvidenceItem {
            evidence_id: item.evidence_id.clone(),
            evidence_type: item.evidence_type.clone(),
            source_ref: item.source_ref.clone(),
            content: content.clone(),
            content_sha256: item.content_sha256.clone(),
            byte_count: content.len(),
        })
        .collect();
    let (kept, bundle_meta) = bound_bundle(rebuilt, policy);

    let bounding_by_id: std::collections::HashMap<String, ItemBoundingMeta> = bounded_items
        .into_iter()
        .map(|(item, _, meta)| (item.evidence_id, meta))
        .collect();

    // Pre-redaction digest over what survived bounding.
    let pre_redaction: Vec<(String, String)> = kept
        .iter()
        .map(|i| (i.evidence_id.clone(), i.content.clone()))
        .collect();
    let content_sha256 = items_digest(&pre_redaction).map_err(|e| vec![e.to_string()])?;

    // Redaction is a post-bounding step.
    let mut all_redactions = Vec::new();
    let mut finished = Vec::with_capacity(kept.len());
    for item in kept {
        let (content, meta) = redact(&item.content, policy.enable_redaction, custom_rules);
        all_redactions.extend(meta.redactions);
        let bounding = bounding_by_id
            .get(&item.evidence_id)
            .cloned()
            .unwrap_or(ItemBoundingMeta {
                applied: false,
                original_size: item.byte_count,
                bounded_size: item.byte_count,
            });
        finished.push(BundledItem {
            evidence_id: item.evidence_id,
            evidence_type: item.evidence_type,
            source_ref: item.source_ref,
            byte_count: content.len(),
            content_sha256: item.content_sha256,
            content,
            bounding,
            redaction_count: meta.redaction_count,
        });
    }

    let redaction_applied = policy.enable_redaction && !all_redactions.is_empty();
    let content_sha256_redacted = if redaction_applied {
        let redacted_pairs: Vec<(String, String)> = finished
            .iter()
            .map(|i| (i.evidence_id.clone(), i.content.clone()))
            .collect();
        Some(items_digest(&redacted_pairs).map_err(|e| vec![e.to_string()])?)
    } else {
        None
    };

    let retained_bytes = bundle_meta.total_bytes;
    let summary = json!({
        "item_count": finished.len(),
        "items_dropped": bundle_meta.items_dropped,
        "total_bytes": retained_bytes,
        "bytes_dropped": input_bytes.saturating_sub(retained_bytes),
        "bounding_applied": bundle_meta.applied || finished.iter().any(|i| i.bounding.applied),
        "redaction_applied": redaction_applied,
        "redaction_count": all_redactions.len(),
        "content_hash_basis": "pre_redaction",
        "canon_version": CANON_VERSION,
    });

    Ok(EvidenceBundle {
        bundle_id: Uuid::new_v4().to_string(),
        build_version: BUNDLE_BUILD_VERSION.to_string(),
        policy: serde_json::to_value(policy).map_err(|e| vec![e.to_string()])?,
        summary,
        items: finished,
        content_sha256,
        content_sha256_redacted,
        redactions: all_redactions,
    })
}
