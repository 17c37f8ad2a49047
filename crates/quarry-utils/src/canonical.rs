//! Canonical JSON serialization and SHA-256 content hashing.
//!
//! Every content hash in the system is computed over the canonical form:
//! strings NFC-normalized at every level, mapping keys sorted, minimal
//! whitespace (RFC 8785 emission). The function is pure: repeated calls on
//! the same value produce byte-identical output, which is what makes lake
//! paths and dedupe decisions reproducible across runs and hosts.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::CanonicalError;

/// Identifies the canonicalization algorithm revision. Stored alongside
/// hashes so a future algorithm change can coexist with old records.
pub const CANON_VERSION: &str = "jcs-nfc-v1";

/// Emit a value as canonical JSON: NFC-normalized strings, sorted keys,
/// minimal whitespace. List order is preserved.
pub fn canonicalize(value: &Value) -> Result<String, CanonicalError> {
    let normalized = nfc_normalize(value);
    let bytes = serde_json_canonicalizer::to_vec(&normalized).map_err(|e| {
        CanonicalError::Emit {
            reason: e.to_string(),
        }
    })?;
    String::from_utf8(bytes).map_err(|_| CanonicalError::InvalidUtf8)
}

/// Canonicalize any serializable value.
pub fn canonicalize_serialize<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json = serde_json::to_value(value)?;
    canonicalize(&json)
}

/// SHA-256 of the canonical form, as 64 lowercase hex chars.
pub fn content_hash(value: &Value) -> Result<String, CanonicalError> {
    let canonical = canonicalize(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// SHA-256 hex digest of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Recursively NFC-normalize every string in a JSON value, including
/// object keys. Two different Unicode encodings of the same text hash
/// identically after this pass.
fn nfc_normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.nfc().collect()),
        Value::Array(items) => Value::Array(items.iter().map(nfc_normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.nfc().collect::<String>(), nfc_normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
