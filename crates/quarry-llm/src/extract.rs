//! Lenient JSON extraction from model output.
//!
//! Models under a JSON schema constraint still occasionally wrap the object
//! in prose or whitespace. The strategies run in order: direct parse,
//! trimmed parse, then (optionally) the first balanced `{...}` block.
//! Every failed strategy leaves a breadcrumb in the error list.

use serde_json::Value;

/// Try to pull a JSON object out of `content`. Returns the parsed value
/// and the list of strategy errors accumulated along the way.
#[must_use]
pub fn parse_json_lenient(content: &str, extract_embedded: bool) -> (Option<Value>, Vec<String>) {
    let mut errors = Vec::new();

    match serde_json::from_str::<Value>(content) {
        Ok(value) => return (Some(value), errors),
        Err(err) => errors.push(format!("direct parse failed: {err}")),
    }

    match serde_json::from_str::<Value>(content.trim()) {
        Ok(value) => return (Some(value), errors),
        Err(err) => errors.push(format!("trimmed parse failed: {err}")),
    }

    if extract_embedded {
        match extract_balanced_object(content) {
            Some(candidate) => match serde_json::from_str::<Value>(candidate) {
                Ok(value) => return (Some(value), errors),
                Err(err) => errors.push(format!("embedded parse failed: {err}")),
            },
            None => errors.push("embedded parse failed: no balanced object found".to_string()),
        }
    }

    (None, errors)
}

/// First `{...}` block with balanced braces, brace counting only (good
/// enough for model output; braces inside strings are rare there and the
/// subsequent parse rejects false positives).
fn extract_balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in content[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse_succeeds() {
        let (value, errors) = parse_json_lenient(r#"{"key": "value"}"#, false);
        assert_eq!(value.unwrap()["key"], "value");
        assert!(errors.is_empty());
    }

    #[test]
    fn whitespace_wrapped_json_parses() {
        let (value, errors) = parse_json_lenient("  \n {\"a\": 1} \n ", false);
        assert_eq!(value.unwrap()["a"], 1);
        assert!(!errors.is_empty());
    }

    #[test]
    fn embedded_json_extracted_when_enabled() {
        let content = "Here is the result:\n{\"answer\": 42, \"nested\": {\"x\": 1}}\nThanks!";
        let (value, _) = parse_json_lenient(content, true);
        assert_eq!(value.unwrap(), json!({"answer": 42, "nested": {"x": 1}}));
    }

    #[test]
    fn embedded_json_ignored_when_disabled() {
        let content = "prose {\"answer\": 42} prose";
        let (value, errors) = parse_json_lenient(content, false);
        assert!(value.is_none());
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn unbalanced_braces_fail_with_breadcrumbs() {
        let (value, errors) = parse_json_lenient("text { \"open\": 1 ", true);
        assert!(value.is_none());
        assert!(errors.iter().any(|e| e.contains("no balanced object")));
    }

    #[test]
    fn no_object_at_all() {
        let (value, errors) = parse_json_lenient("just words", true);
        assert!(value.is_none());
        assert!(errors.len() >= 3);
    }
}
