//! Discovery plugins: turn a fetched record into follow-up work items.
//!
//! Discovered items go through the normal enqueue path, where duplicates
//! are silently dropped by the dedupe index, so crawling a cyclic link
//! graph terminates on its own.

use quarry_state::WorkItem;

use crate::record::IngestRecord;

/// Inspects a fetched record and proposes further work.
pub trait DiscoveryPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn discover(&self, record: &IngestRecord) -> Vec<WorkItem>;
}

/// Follows `resource.links` arrays in fetched payloads, yielding one work
/// item per linked resource id in the same source.
pub struct LinkDiscovery {
    /// `{id}` is replaced with the linked resource id.
    uri_template: String,
}

impl LinkDiscovery {
    #[must_use]
    pub fn new(uri_template: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
        }
    }
}

impl DiscoveryPlugin for LinkDiscovery {
    fn name(&self) -> &str {
        "link_discovery"
    }

    fn discover(&self, record: &IngestRecord) -> Vec<WorkItem> {
        let Some(links) = record
            .payload
            .pointer("/resource/links")
            .and_then(|v| v.as_array())
        else {
            return Vec::new();
        };

        links
            .iter()
            .filter_map(|link| link.as_str())
            .map(|id| {
                WorkItem::new(
                    record.source_system.clone(),
                    record.source_name.clone(),
                    record.resource_type.clone(),
                    id,
                    self.uri_template.replace("{id}", id),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_payload(payload: serde_json::Value) -> IngestRecord {
        IngestRecord::from_fetch(
            "test",
            "src",
            "resource",
            "root",
            "https://example.com/root",
            "GET",
            200,
            payload,
            1,
        )
        .unwrap()
    }

    #[test]
    fn links_become_work_items() {
        let plugin = LinkDiscovery::new("https://example.com/resources/{id}");
        let record = record_with_payload(json!({
            "resource": {"id": "root", "links": ["child_a", "child_b"]}
        }));

        let items = plugin.discover(&record);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].resource_id, "child_a");
        assert_eq!(items[0].request_uri, "https://example.com/resources/child_a");
        assert_eq!(items[0].source_name, "src");
    }

    #[test]
    fn payload_without_links_yields_nothing() {
        let plugin = LinkDiscovery::new("https://example.com/{id}");
        let record = record_with_payload(json!({"resource": {"id": "root"}}));

        assert!(plugin.discover(&record).is_empty());
    }
}
