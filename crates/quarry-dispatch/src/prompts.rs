//! Prompt templates and output schemas for the built-in interrogations.
//!
//! An interrogation pairs a prompt with a JSON output schema under a stable
//! versioned key. Prompts are model-agnostic and deterministic: the user
//! message is a canonical-ish JSON envelope, never raw payload dumps.

use serde_json::{json, Value};

use quarry_llm::ChatMessage;

/// Version stamp recorded in run metrics.
pub const PROMPT_VERSION: &str = "v1_contract";

const PAGE_CLASSIFICATION_SYSTEM: &str = "\
You are a wiki page classifier and metadata extractor. You will be given a \
page title and a bounded excerpt from the article body. Infer the page's \
entity type, a one-sentence descriptor, a confidence score, and suggested \
tags for indexing.

OUTPUT RULES (STRICT):
- Return ONLY valid JSON matching the provided schema
- No markdown, no extra keys, no commentary
- If uncertain, set needs_review=true and reduce confidence

PRIMARY TYPE RUBRIC (decision order):
1. reference_meta - lists, indexes, timelines, disambiguation pages
2. vehicle_craft - ships, vehicles, stations with specs or a manufacturer
3. object_item - physical objects: weapons, armor, clothing, gear
4. person_character - sentient individuals with a biography
5. location_place - planets, cities, regions, facilities, structures
6. species - biological species or sentient groups, never individuals
7. organization - governments, militaries, orders, corporations
8. event_conflict - battles, wars, missions, treaties, catastrophes
9. work_media - published works: films, episodes, novels, games
10. time_period - eras, ages, reigns
11. concept - abstract ideas, systems, technologies as concepts
12. technical_page - wiki infrastructure: templates, policies, help pages
13. unknown - ONLY if nothing above applies; explain in notes

DESCRIPTOR RULES:
- Exactly one sentence, at most 50 words, plain text, no markup

CONFIDENCE CALIBRATION:
- 0.90-1.00 clear match; 0.70-0.89 minor ambiguity
- below 0.70: set needs_review=true";

const ENTITY_FACTS_SYSTEM: &str = "\
You are a careful fact extractor. You will be given an entity identifier \
and bounded evidence text. Extract discrete, verifiable facts about the \
entity, each tied to the evidence items that support it.

OUTPUT RULES (STRICT):
- Return ONLY valid JSON matching the provided schema
- Every fact must cite at least one evidence_id from the input
- Do not invent facts absent from the evidence
- If the evidence is insufficient, return an empty facts list and set \
needs_review=true";

/// JSON schema the classifier output must satisfy.
#[must_use]
pub fn page_classification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "primary_type": {
                "type": "string",
                "enum": [
                    "reference_meta", "vehicle_craft", "object_item",
                    "person_character", "location_place", "species",
                    "organization", "event_conflict", "work_media",
                    "time_period", "concept", "technical_page", "unknown"
                ]
            },
            "descriptor_sentence": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "needs_review": {"type": "boolean"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "notes": {"type": "string"}
        },
        "required": ["primary_type", "descriptor_sentence", "confidence", "needs_review", "tags"]
    })
}

/// JSON schema the fact extractor output must satisfy.
#[must_use]
pub fn entity_facts_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entity_type": {"type": "string"},
            "entity_id": {"type": "string"},
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "fact": {"type": "string"},
                        "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "evidence_ids": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["fact", "confidence", "evidence_ids"]
                }
            },
            "summary": {"type": "string"},
            "needs_review": {"type": "boolean"}
        },
        "required": ["entity_type", "entity_id", "facts", "needs_review"]
    })
}

/// Messages for a page classification call.
#[must_use]
pub fn page_classification_messages(
    title: &str,
    namespace: &str,
    excerpt_text: &str,
    resource_id: Option<&str>,
) -> Vec<ChatMessage> {
    let mut envelope = json!({
        "title": title,
        "namespace": namespace,
        "excerpt_text": excerpt_text,
    });
    if let Some(id) = resource_id {
        envelope["resource_id"] = json!(id);
    }

    vec![
        ChatMessage::system(PAGE_CLASSIFICATION_SYSTEM),
        ChatMessage::user(envelope.to_string()),
    ]
}

/// Messages for an entity facts call.
#[must_use]
pub fn entity_facts_messages(
    entity_type: &str,
    entity_id: &str,
    evidence_text: &str,
) -> Vec<ChatMessage> {
    let envelope = json!({
        "entity_type": entity_type,
        "entity_id": entity_id,
        "evidence": evidence_text,
    });

    vec![
        ChatMessage::system(ENTITY_FACTS_SYSTEM),
        ChatMessage::user(envelope.to_string()),
    ]
}
