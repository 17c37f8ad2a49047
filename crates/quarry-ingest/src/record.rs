//! Canonical exchange and ingest records.
//!
//! The content hash covers exchange identity plus request/response and
//! nothing else: re-observing the same upstream content at a different
//! wall-clock time produces the same hash, which is what makes lake writes
//! idempotent across re-runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quarry_utils::canonical::content_hash;
use quarry_utils::error::CanonicalError;

/// How a resource was acquired. Part of the dedupe key when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionVariant {
    Raw,
    Html,
}

impl AcquisitionVariant {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionVariant::Raw => "raw",
            AcquisitionVariant::Html => "html",
        }
    }
}

impl std::str::FromStr for AcquisitionVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(AcquisitionVariant::Raw),
            "html" => Ok(AcquisitionVariant::Html),
            other => Err(format!("unknown acquisition variant: {other}")),
        }
    }
}

/// Who produced a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub runner_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// The hash input for an exchange: identity plus request/response, with
/// wall-clock fields deliberately absent.
#[must_use]
pub fn build_hash_input(
    exchange_type: &str,
    source_system: &str,
    entity_type: &str,
    natural_key: &str,
    request: &Value,
    response: &Value,
) -> Value {
    json!({
        "exchange_type": exchange_type,
        "source_system": source_system,
        "entity_type": entity_type,
        "natural_key": natural_key,
        "request": request,
        "response": response,
    })
}

/// One observed upstream exchange, content-addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub exchange_id: String,
    pub exchange_type: String,
    pub source_system: String,
    pub entity_type: String,
    pub natural_key: String,
    pub request: Value,
    pub response: Value,
    pub observed_at_utc: DateTime<Utc>,
    pub content_sha256: String,
    pub provenance: Provenance,
    pub tags: Vec<String>,
}

impl ExchangeRecord {
    /// Create a record, computing the content hash from the hash input.
    pub fn create(
        exchange_type: impl Into<String>,
        source_system: impl Into<String>,
        entity_type: impl Into<String>,
        natural_key: impl Into<String>,
        request: Value,
        response: Value,
    ) -> Result<Self, CanonicalError> {
        let exchange_type = exchange_type.into();
        let source_system = source_system.into();
        let entity_type = entity_type.into();
        let natural_key = natural_key.into();

        let hash_input = build_hash_input(
            &exchange_type,
            &source_system,
            &entity_type,
            &natural_key,
            &request,
            &response,
        );
        let content_sha256 = content_hash(&hash_input)?;

        Ok(Self {
            exchange_id: quarry_utils::ids::new_id(),
            exchange_type,
            source_system,
            entity_type,
            natural_key,
            request,
            response,
            observed_at_utc: Utc::now(),
            content_sha256,
            provenance: Provenance::default(),
            tags: Vec::new(),
        })
    }

    /// `source_system:entity_type:natural_key`
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source_system, self.entity_type, self.natural_key
        )
    }

    /// `source_system|entity_type|natural_key`, the identity part of the
    /// hash input.
    #[must_use]
    pub fn hash_input_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source_system, self.entity_type, self.natural_key
        )
    }
}

/// Recompute and compare the content hash; false means tampering (or a
/// hash computed under a different canonicalization revision).
#[must_use]
pub fn verify_content_hash(record: &ExchangeRecord) -> bool {
    let hash_input = build_hash_input(
        &record.exchange_type,
        &record.source_system,
        &record.entity_type,
        &record.natural_key,
        &record.request,
        &record.response,
    );
    match content_hash(&hash_input) {
        Ok(hash) => hash == record.content_sha256,
        Err(_) => false,
    }
}

/// The persisted result of fetching one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub ingest_id: String,
    pub source_system: String,
    pub source_name: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_uri: String,
    pub request_method: String,
    pub status_code: u16,
    pub payload: Value,
    pub fetched_at_utc: DateTime<Utc>,
    pub attempt: i64,
    pub content_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<AcquisitionVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl IngestRecord {
    /// Build a record from a fetch result, hashing identity + payload
    /// (never the fetch timestamp).
    #[allow(clippy::too_many_arguments)]
    pub fn from_fetch(
        source_system: impl Into<String>,
        source_name: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        request_uri: impl Into<String>,
        request_method: impl Into<String>,
        status_code: u16,
        payload: Value,
        attempt: i64,
    ) -> Result<Self, CanonicalError> {
        let source_system = source_system.into();
        let source_name = source_name.into();
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let request_uri = request_uri.into();
        let request_method = request_method.into();

        let hash_input = json!({
            "source_system": source_system,
            "source_name": source_name,
            "resource_type": resource_type,
            "resource_id": resource_id,
            "request_uri": request_uri,
            "status_code": status_code,
            "payload": payload,
        });
        let content_sha256 = content_hash(&hash_input)?;

        Ok(Self {
            ingest_id: quarry_utils::ids::new_id(),
            source_system,
            source_name,
            resource_type,
            resource_id,
            request_uri,
            request_method,
            status_code,
            payload,
            fetched_at_utc: Utc::now(),
            attempt,
            content_sha256,
            error_message: None,
            variant: None,
            content_type: None,
            content_length: None,
            duration_ms: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(response: Value) -> ExchangeRecord {
        ExchangeRecord::create(
            "http",
            "test",
            "page",
            "123",
            json!({"url": "http://example.com"}),
            response,
        )
        .unwrap()
    }

    #[test]
    fn hash_is_sha256_hex() {
        let record = sample(json!({"data": "test"}));
        assert_eq!(record.content_sha256.len(), 64);
        assert!(record.content_sha256.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_content_same_hash() {
        let a = sample(json!({"data": "test"}));
        let b = sample(json!({"data": "test"}));
        assert_eq!(a.content_sha256, b.content_sha256);
        // Record ids are fresh each time.
        assert_ne!(a.exchange_id, b.exchange_id);
    }

    #[test]
    fn different_content_different_hash() {
        let a = sample(json!({"data": "test1"}));
        let b = sample(json!({"data": "test2"}));
        assert_ne!(a.content_sha256, b.content_sha256);
    }

    #[test]
    fn observed_time_excluded_from_hash() {
        let mut a = sample(json!({"data": "test"}));
        let mut b = sample(json!({"data": "test"}));
        a.observed_at_utc = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        b.observed_at_utc = DateTime::parse_from_rfc3339("2024-12-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(a.content_sha256, b.content_sha256);
        assert!(verify_content_hash(&a));
        assert!(verify_content_hash(&b));
    }

    #[test]
    fn tampering_flips_verify() {
        let mut record = sample(json!({"data": "test"}));
        assert!(verify_content_hash(&record));

        record.response = json!({"modified": true});
        assert!(!verify_content_hash(&record));
    }

    #[test]
    fn keys_use_their_separators() {
        let record = ExchangeRecord::create(
            "http",
            "wookieepedia",
            "page",
            "Luke_Skywalker",
            Value::Null,
            Value::Null,
        )
        .unwrap();

        assert_eq!(record.dedupe_key(), "wookieepedia:page:Luke_Skywalker");
        assert_eq!(record.hash_input_key(), "wookieepedia|page|Luke_Skywalker");
    }

    #[test]
    fn hash_input_lists_exact_fields() {
        let input = build_hash_input(
            "http",
            "test",
            "page",
            "123",
            &json!({"url": "u"}),
            &json!({"data": "d"}),
        );
        let obj = input.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "entity_type",
                "exchange_type",
                "natural_key",
                "request",
                "response",
                "source_system"
            ]
        );
    }

    #[test]
    fn ingest_record_hash_ignores_fetch_time() {
        let make = || {
            IngestRecord::from_fetch(
                "test",
                "src",
                "item",
                "1",
                "https://example.com/1",
                "GET",
                200,
                json!({"x": 1}),
                1,
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        assert_eq!(a.content_sha256, b.content_sha256);
    }

    #[test]
    fn variant_parses_from_string() {
        assert_eq!("raw".parse::<AcquisitionVariant>().unwrap(), AcquisitionVariant::Raw);
        assert_eq!("html".parse::<AcquisitionVariant>().unwrap(), AcquisitionVariant::Html);
        assert!("pdf".parse::<AcquisitionVariant>().is_err());
    }
}
