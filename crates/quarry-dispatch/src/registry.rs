//! Versioned job-type definitions and their registry.
//!
//! The global registry is built once at startup from the code-resident
//! catalog and never mutated after workers start. Instance registries are
//! mutable and exist for wiring custom handlers (and tests).

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Everything the dispatcher needs to know about one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeDefinition {
    pub job_type: String,
    pub display_name: String,
    /// The versioned prompt/schema contract this job type runs under.
    pub interrogation_key: String,
    /// Where the handler lives, for operators reading job listings.
    pub handler_ref: String,
    pub max_attempts: i64,
    pub default_priority: i64,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl JobTypeDefinition {
    #[must_use]
    pub fn new(
        job_type: impl Into<String>,
        display_name: impl Into<String>,
        interrogation_key: impl Into<String>,
        handler_ref: impl Into<String>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            display_name: display_name.into(),
            interrogation_key: interrogation_key.into(),
            handler_ref: handler_ref.into(),
            max_attempts: 3,
            default_priority: 100,
            timeout_seconds: 300,
            version: None,
            description: None,
            tags: Vec::new(),
        }
    }
}

/// Lookup table from job type to definition. Missing lookups return
/// `None`, never an error.
#[derive(Debug, Clone, Default)]
pub struct JobTypeRegistry {
    definitions: HashMap<String, JobTypeDefinition>,
}

fn builtin_definitions() -> Vec<JobTypeDefinition> {
    vec![
        JobTypeDefinition {
            version: Some("1.0".to_string()),
            description: Some(
                "Classify a wiki page into an entity type with confidence and tags".to_string(),
            ),
            tags: vec!["classification".to_string()],
            ..JobTypeDefinition::new(
                "page_classification",
                "Page Classification",
                "page_classification_v1",
                "quarry_dispatch::handlers::page_classification",
            )
        },
        JobTypeDefinition {
            version: Some("1.0".to_string()),
            description: Some(
                "Extract structured facts about an entity from bounded evidence".to_string(),
            ),
            tags: vec!["extraction".to_string()],
            ..JobTypeDefinition::new(
                "entity_facts",
                "Entity Facts",
                "entity_facts_v1",
                "quarry_dispatch::handlers::entity_facts",
            )
        },
    ]
}

impl JobTypeRegistry {
    /// Empty registry (tests, custom wiring).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in catalog.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        for definition in builtin_definitions() {
            registry.register(definition);
        }
        registry
    }

    /// Later registrations replace earlier ones for the same job type.
    pub fn register(&mut self, definition: JobTypeDefinition) {
        self.definitions
            .insert(definition.job_type.clone(), definition);
    }

    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<&JobTypeDefinition> {
        self.definitions.get(job_type)
    }

    #[must_use]
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn list_definitions(&self) -> Vec<&JobTypeDefinition> {
        let mut definitions: Vec<&JobTypeDefinition> = self.definitions.values().collect();
        definitions.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        definitions
    }
}

static GLOBAL_REGISTRY: LazyLock<JobTypeRegistry> = LazyLock::new(JobTypeRegistry::with_builtins);

/// The process-wide registry, initialized at startup, immutable afterwards.
#[must_use]
pub fn global_registry() -> &'static JobTypeRegistry {
    &GLOBAL_REGISTRY
}

/// Convenience lookup against the global registry.
#[must_use]
pub fn get_job_type(job_type: &str) -> Option<&'static JobTypeDefinition> {
    GLOBAL_REGISTRY.get(job_type)
}

/// Map an interrogation key to its job type by stripping the `_vN` version
/// suffix when the result is a registered type; otherwise the key itself
/// is the job type.
#[must_use]
pub fn infer_job_type(registry: &JobTypeRegistry, interrogation_key: &str) -> String {
    if let Some(idx) = interrogation_key.rfind("_v") {
        let (base, suffix) = interrogation_key.split_at(idx);
        if suffix[2..].chars().all(|c| c.is_ascii_digit())
            && !suffix[2..].is_empty()
            && registry.get(base).is_some()
        {
            return base.to_string();
        }
    }
    interrogation_key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults() {
        let definition = JobTypeDefinition::new("test_job", "Test Job", "test_v1", "test::handle");

        assert_eq!(definition.max_attempts, 3);
        assert_eq!(definition.default_priority, 100);
        assert_eq!(definition.timeout_seconds, 300);
        assert!(definition.version.is_none());
        assert!(definition.tags.is_empty());
    }

    #[test]
    fn builtins_are_registered() {
        let registry = JobTypeRegistry::with_builtins();
        assert!(registry.list_types().len() >= 2);

        let page = registry.get("page_classification").unwrap();
        assert_eq!(page.display_name, "Page Classification");
        assert_eq!(page.interrogation_key, "page_classification_v1");

        let facts = registry.get("entity_facts").unwrap();
        assert_eq!(facts.interrogation_key, "entity_facts_v1");
    }

    #[test]
    fn register_and_get() {
        let mut registry = JobTypeRegistry::new();
        registry.register(JobTypeDefinition::new("custom", "Custom", "custom_v1", "x::handle"));

        assert!(registry.get("custom").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn global_registry_serves_builtins() {
        assert!(get_job_type("page_classification").is_some());
        assert!(get_job_type("does_not_exist").is_none());
    }

    #[test]
    fn infer_strips_version_suffix_for_known_types() {
        let registry = JobTypeRegistry::with_builtins();

        assert_eq!(
            infer_job_type(&registry, "page_classification_v1"),
            "page_classification"
        );
        assert_eq!(infer_job_type(&registry, "entity_facts_v2"), "entity_facts");
        // Unknown base: the key itself is the job type.
        assert_eq!(infer_job_type(&registry, "custom_v1"), "custom_v1");
        // No version suffix at all.
        assert_eq!(infer_job_type(&registry, "plain_key"), "plain_key");
    }
}
