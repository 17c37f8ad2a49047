//! Connector request/response contract.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fetch request handed to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRequest {
    pub uri: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ConnectorRequest {
    #[must_use]
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: "GET".to_string(),
            headers: None,
            body: None,
            params: BTreeMap::new(),
        }
    }
}

/// A fetch response. `status_code` 0 means the transport itself failed;
/// `error_message` carries the detail either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorResponse {
    pub status_code: u16,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Parsed `Retry-After` hint, if the upstream sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ConnectorResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error_message.is_none()
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_seconds.map(Duration::from_secs)
    }

    /// Transport-level failure (no HTTP exchange happened).
    #[must_use]
    pub fn transport_error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status_code: 0,
            payload: Value::Null,
            headers: None,
            duration_ms,
            error_message: Some(message.into()),
            retry_after_seconds: None,
        }
    }
}

/// An upstream fetcher. Implementations may keep a private rate-limit
/// clock; they hold no queue state.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable connector name, matched against `WorkItem::source_system`.
    fn name(&self) -> &str;

    /// Fetch a resource. Never returns `Err`; failures are encoded in the
    /// response.
    async fn fetch(&self, request: &ConnectorRequest) -> ConnectorResponse;
}
