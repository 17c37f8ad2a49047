//! Deterministic connector for end-to-end tests.
//!
//! Serves a fixed synthetic corpus with stable payloads per resource id,
//! optional error injection for a configured subset, and a request history
//! for assertions. No network involved anywhere.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use quarry_state::WorkItem;

use crate::types::{Connector, ConnectorRequest, ConnectorResponse};

/// Size of the built-in synthetic corpus.
pub const SYNTHETIC_RESOURCE_COUNT: usize = 5;

fn synthetic_resource(resource_id: &str, index: usize) -> Value {
    json!({
        "id": resource_id,
        "title": format!("Synthetic Resource {index}"),
        "type": "synthetic",
        "body": format!("Deterministic body text for {resource_id}."),
        "links": [format!("test_resource_{:03}", (index + 1) % SYNTHETIC_RESOURCE_COUNT)],
    })
}

/// Test double implementing the connector contract.
pub struct TestConnector {
    resources: Vec<(String, Value)>,
    error_resource_ids: HashSet<String>,
    history: Mutex<Vec<ConnectorRequest>>,
}

impl Default for TestConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConnector {
    /// Connector over the default synthetic corpus.
    #[must_use]
    pub fn new() -> Self {
        let resources = (0..SYNTHETIC_RESOURCE_COUNT)
            .map(|i| {
                let id = format!("test_resource_{i:03}");
                let value = synthetic_resource(&id, i);
                (id, value)
            })
            .collect();
        Self {
            resources,
            error_resource_ids: HashSet::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Connector over a caller-supplied corpus. Each value must carry an
    /// `id` field.
    #[must_use]
    pub fn with_resources(resources: Vec<Value>) -> Self {
        let resources = resources
            .into_iter()
            .filter_map(|v| {
                let id = v.get("id")?.as_str()?.to_string();
                Some((id, v))
            })
            .collect();
        Self {
            resources,
            error_resource_ids: HashSet::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Inject a 500 for the given resource ids.
    #[must_use]
    pub fn with_errors(mut self, resource_ids: impl IntoIterator<Item = String>) -> Self {
        self.error_resource_ids = resource_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Requests seen so far, in order.
    #[must_use]
    pub fn request_history(&self) -> Vec<ConnectorRequest> {
        self.history.lock().expect("history lock").clone()
    }

    /// Clear the request history.
    pub fn reset(&self) {
        self.history.lock().expect("history lock").clear();
    }

    /// One pending work item per corpus resource.
    #[must_use]
    pub fn seed_work_items(&self, source_name: &str, priority: i64) -> Vec<WorkItem> {
        self.resources
            .iter()
            .map(|(id, _)| {
                WorkItem::new(
                    "test",
                    source_name,
                    "resource",
                    id.clone(),
                    format!("https://test.example.com/resources/{id}"),
                )
                .with_priority(priority)
            })
            .collect()
    }

    fn resource_id_from_uri(uri: &str) -> &str {
        uri.rsplit('/').next().unwrap_or(uri)
    }
}

#[async_trait]
impl Connector for TestConnector {
    fn name(&self) -> &str {
        "test"
    }

    async fn fetch(&self, request: &ConnectorRequest) -> ConnectorResponse {
        self.history.lock().expect("history lock").push(request.clone());

        let resource_id = Self::resource_id_from_uri(&request.uri);

        if self.error_resource_ids.contains(resource_id) {
            return ConnectorResponse {
                status_code: 500,
                payload: json!({"error": "injected failure"}),
                headers: None,
                duration_ms: 0,
                error_message: Some(format!("injected failure for {resource_id}")),
                retry_after_seconds: None,
            };
        }

        match self.resources.iter().find(|(id, _)| id == resource_id) {
            Some((_, value)) => ConnectorResponse {
                status_code: 200,
                payload: json!({"resource": value}),
                headers: None,
                duration_ms: 0,
                error_message: None,
                retry_after_seconds: None,
            },
            None => ConnectorResponse {
                status_code: 404,
                payload: json!({"error": format!("resource not found: {resource_id}")}),
                headers: None,
                duration_ms: 0,
                error_message: None,
                retry_after_seconds: None,
            },
        }
    }
}

/// Predictable pending work items for tests (`test_resource_000`, ...).
#[must_use]
pub fn create_test_work_items(count: usize, source_name: &str) -> Vec<WorkItem> {
    (0..count)
        .map(|i| {
            let id = format!("test_resource_{i:03}");
            WorkItem::new(
                "test",
                source_name,
                "resource",
                id.clone(),
                format!("https://test.example.com/resources/{id}"),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_known_resource_succeeds() {
        let connector = TestConnector::new();
        let request =
            ConnectorRequest::get("https://test.example.com/resources/test_resource_001");

        let response = connector.fetch(&request).await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.payload["resource"]["id"], "test_resource_001");
    }

    #[tokio::test]
    async fn fetch_unknown_resource_is_404() {
        let connector = TestConnector::new();
        let request = ConnectorRequest::get("https://test.example.com/resources/nonexistent");

        let response = connector.fetch(&request).await;

        assert_eq!(response.status_code, 404);
        assert!(response.payload.get("error").is_some());
    }

    #[tokio::test]
    async fn injected_errors_return_500() {
        let connector =
            TestConnector::new().with_errors(["test_resource_001".to_string()]);
        let request =
            ConnectorRequest::get("https://test.example.com/resources/test_resource_001");

        let response = connector.fetch(&request).await;

        assert_eq!(response.status_code, 500);
        assert!(response.error_message.is_some());
    }

    #[tokio::test]
    async fn history_records_and_resets() {
        let connector = TestConnector::new();

        connector
            .fetch(&ConnectorRequest::get("/resources/test_resource_001"))
            .await;
        connector
            .fetch(&ConnectorRequest::get("/resources/test_resource_002"))
            .await;
        assert_eq!(connector.request_history().len(), 2);

        connector.reset();
        assert!(connector.request_history().is_empty());
    }

    #[tokio::test]
    async fn responses_are_stable_per_resource() {
        let connector = TestConnector::new();
        let request =
            ConnectorRequest::get("https://test.example.com/resources/test_resource_003");

        let first = connector.fetch(&request).await;
        let second = connector.fetch(&request).await;

        assert_eq!(first.payload, second.payload);
        assert_eq!(first.status_code, second.status_code);
    }

    #[test]
    fn seed_work_items_cover_corpus() {
        let connector = TestConnector::new();
        let items = connector.seed_work_items("test_source", 50);

        assert_eq!(items.len(), SYNTHETIC_RESOURCE_COUNT);
        for item in &items {
            assert_eq!(item.source_system, "test");
            assert_eq!(item.source_name, "test_source");
            assert_eq!(item.priority, 50);
        }
    }

    #[test]
    fn created_work_items_are_predictable() {
        let items = create_test_work_items(3, "custom");

        assert_eq!(items[0].resource_id, "test_resource_000");
        assert_eq!(items[1].resource_id, "test_resource_001");
        assert_eq!(items[2].resource_id, "test_resource_002");
    }

    #[test]
    fn custom_corpus_respected() {
        let connector = TestConnector::with_resources(vec![json!({
            "id": "custom_001", "title": "Custom Resource"
        })]);
        assert_eq!(connector.resource_count(), 1);
    }
}
