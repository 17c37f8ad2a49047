//! Per-item and bundle-level bounding.

use serde::{Deserialize, Serialize};

use crate::policy::{EvidenceItem, EvidencePolicy};

/// Metadata recorded when an item is (or is not) truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemBoundingMeta {
    pub applied: bool,
    pub original_size: usize,
    pub bounded_size: usize,
}

/// Metadata recorded for a bundle-level bounding pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleBoundingMeta {
    pub applied: bool,
    pub items_dropped: usize,
    /// Total bytes retained across accepted items.
    pub total_bytes: usize,
}

/// Truncate `content` to at most `max_bytes` without splitting a UTF-8
/// code point. The result is always a valid UTF-8 prefix of the input.
pub fn bound_item(content: &str, max_bytes: usize) -> (String, ItemBoundingMeta) {
    let original_size = content.len();

    if original_size <= max_bytes {
        return (
            content.to_string(),
            ItemBoundingMeta {
                applied: false,
                original_size,
                bounded_size: original_size,
            },
        );
    }

    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let bounded = &content[..cut];

    (
        bounded.to_string(),
        ItemBoundingMeta {
            applied: true,
            original_size,
            bounded_size: bounded.len(),
        },
    )
}

/// Walk items in input order, accepting while running totals stay under
/// `max_items` and `max_total_bytes`. The first N are kept; everything
/// after the first rejection is dropped.
pub fn bound_bundle(
    items: Vec<EvidenceItem>,
    policy: &EvidencePolicy,
) -> (Vec<EvidenceItem>, BundleBoundingMeta) {
    let input_count = items.len();
    let mut accepted = Vec::new();
    let mut total_bytes = 0usize;

    for item in items {
        if accepted.len() >= policy.max_items {
            break;
        }
        if total_bytes + item.byte_count > policy.max_total_bytes {
            break;
        }
        total_bytes += item.byte_count;
        accepted.push(item);
    }

    let items_dropped = input_count - accepted.len();
    let meta = BundleBoundingMeta {
        applied: items_dropped > 0,
        items_dropped,
        total_bytes,
    };

    (accepted, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn items_of(count: usize, size: usize) -> Vec<EvidenceItem> {
        (0..count)
            .map(|i| EvidenceItem::inline(format!("item{i}"), "X".repeat(size)))
            .collect()
    }

    #[test]
    fn content_under_limit_untouched() {
        let (bounded, meta) = bound_item("Short content", 1000);

        assert_eq!(bounded, "Short content");
        assert!(!meta.applied);
        assert_eq!(meta.original_size, 13);
    }

    #[test]
    fn content_over_limit_truncated() {
        let content = "A".repeat(1000);
        let (bounded, meta) = bound_item(&content, 100);

        assert_eq!(bounded.len(), 100);
        assert!(meta.applied);
        assert_eq!(meta.original_size, 1000);
        assert_eq!(meta.bounded_size, 100);
    }

    #[test]
    fn never_splits_a_utf8_code_point() {
        let content = "Hello 世界".repeat(100);
        let (bounded, meta) = bound_item(&content, 50);

        assert!(bounded.len() <= 50);
        assert!(meta.applied);
        assert!(content.starts_with(&bounded));
    }

    #[test]
    fn bundle_within_limits_untouched() {
        let items = items_of(2, 50);
        let policy = EvidencePolicy {
            max_items: 10,
            max_total_bytes: 1024,
            ..EvidencePolicy::default()
        };

        let (bounded, meta) = bound_bundle(items, &policy);

        assert_eq!(bounded.len(), 2);
        assert!(!meta.applied);
        assert_eq!(meta.items_dropped, 0);
    }

    #[test]
    fn max_items_enforced() {
        let items = items_of(10, 10);
        let policy = EvidencePolicy {
            max_items: 5,
            max_total_bytes: 10_000,
            ..EvidencePolicy::default()
        };

        let (bounded, meta) = bound_bundle(items, &policy);

        assert_eq!(bounded.len(), 5);
        assert_eq!(meta.items_dropped, 5);
        assert!(meta.applied);
    }

    #[test]
    fn max_total_bytes_keeps_first_five_of_ten() {
        // Ten items of 100 bytes each under a 500-byte bundle cap.
        let items = items_of(10, 100);
        let policy = EvidencePolicy {
            max_items: 100,
            max_total_bytes: 500,
            ..EvidencePolicy::default()
        };

        let (bounded, meta) = bound_bundle(items, &policy);

        assert_eq!(bounded.len(), 5);
        assert_eq!(meta.total_bytes, 500);
        assert_eq!(meta.items_dropped, 5);
    }

    #[test]
    fn input_order_preserved() {
        let items = items_of(10, 10);
        let policy = EvidencePolicy {
            max_items: 5,
            max_total_bytes: 10_000,
            ..EvidencePolicy::default()
        };

        let (bounded, _) = bound_bundle(items, &policy);

        let ids: Vec<&str> = bounded.iter().map(|i| i.evidence_id.as_str()).collect();
        assert_eq!(ids, vec!["item0", "item1", "item2", "item3", "item4"]);
    }

    proptest! {
        #[test]
        fn bounded_item_is_valid_utf8_prefix(content in "\\PC{0,200}", max in 0usize..128) {
            let (bounded, _) = bound_item(&content, max);
            prop_assert!(bounded.len() <= max);
            prop_assert!(content.starts_with(&bounded));
        }
    }
}
