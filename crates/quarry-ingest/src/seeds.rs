//! Seed work items from configuration.

use quarry_config::SeedConfig;
use quarry_state::WorkItem;

/// Expand seed declarations into pending work items.
#[must_use]
pub fn seed_work_items(seeds: &[SeedConfig]) -> Vec<WorkItem> {
    seeds
        .iter()
        .flat_map(|seed| {
            seed.resource_ids.iter().map(move |id| {
                WorkItem::new(
                    seed.source_system.clone(),
                    seed.source_name.clone(),
                    seed.resource_type.clone(),
                    id.clone(),
                    seed.uri_template.replace("{id}", id),
                )
                .with_priority(seed.priority)
            })
        })
        .collect()
}
