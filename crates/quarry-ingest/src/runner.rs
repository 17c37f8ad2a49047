//! The ingest runner: claim → fetch → persist → discover → complete.
//!
//! One runner instance is one worker. Parallelism is horizontal: spawn
//! several runners over the same store and let the claim contract keep
//! them from colliding. A runner holds no state the queue doesn't; killing
//! one mid-item just means the lease expires and another worker resumes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use quarry_connector::{Connector, ConnectorRequest};
use quarry_lake::{ingest_record_path, FileLakeWriter, LakeError};
use quarry_state::{StateError, StateStore, WorkItem, WorkOutcome};
use quarry_utils::error::CanonicalError;

use crate::discovery::DiscoveryPlugin;
use crate::record::IngestRecord;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("lake error: {0}")]
    Lake(#[from] LakeError),

    #[error("canonicalization error: {0}")]
    Canonical(#[from] CanonicalError),
}

/// Knobs for one runner. Mirrors the `runner` config section.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub batch_size: i64,
    /// Stop after this many items (None = drain the queue).
    pub max_items: Option<u64>,
    pub enable_discovery: bool,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    pub respect_retry_after: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_items: None,
            enable_discovery: true,
            lease: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            respect_retry_after: true,
        }
    }
}

/// Counters reported from one `run` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerMetrics {
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub items_discovered: u64,
}

pub struct IngestRunner {
    store: StateStore,
    connectors: HashMap<String, Arc<dyn Connector>>,
    lake_writers: Vec<FileLakeWriter>,
    discovery_plugins: Vec<Box<dyn DiscoveryPlugin>>,
    options: RunnerOptions,
    worker_id: String,
}

impl IngestRunner {
    #[must_use]
    pub fn new(
        store: StateStore,
        connectors: HashMap<String, Arc<dyn Connector>>,
        lake_writers: Vec<FileLakeWriter>,
        discovery_plugins: Vec<Box<dyn DiscoveryPlugin>>,
        options: RunnerOptions,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            connectors,
            lake_writers,
            discovery_plugins,
            options,
            worker_id: worker_id.into(),
        }
    }

    /// Process the queue until it is drained, `max_items` is reached, or
    /// shutdown is signalled. A shutdown mid-batch finishes the current
    /// item and returns.
    pub async fn run(
        &self,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<RunnerMetrics, IngestError> {
        let mut metrics = RunnerMetrics::default();
        let mut last_heartbeat = Instant::now();

        'outer: loop {
            let remaining = match self.options.max_items {
                Some(max) => {
                    if metrics.items_processed >= max {
                        break;
                    }
                    (max - metrics.items_processed).min(self.options.batch_size as u64) as i64
                }
                None => self.options.batch_size,
            };

            let batch = self
                .store
                .claim_work_items(&self.worker_id, remaining, self.options.lease)
                .await?;
            if batch.is_empty() {
                break;
            }
            debug!(worker_id = %self.worker_id, claimed = batch.len(), "claimed batch");

            for item in &batch {
                if let Some(rx) = &mut shutdown {
                    if *rx.borrow() {
                        info!(worker_id = %self.worker_id, "shutdown signalled, draining");
                        break 'outer;
                    }
                }

                // Inline heartbeat on a time budget: extend leases for the
                // rest of the batch when the interval has elapsed.
                if last_heartbeat.elapsed() >= self.options.heartbeat_interval {
                    for pending in &batch {
                        let _ = self
                            .store
                            .heartbeat_work_item(
                                &pending.work_item_id,
                                &self.worker_id,
                                self.options.lease,
                            )
                            .await;
                    }
                    last_heartbeat = Instant::now();
                }

                let succeeded = self.process_item(item, &mut metrics).await?;
                metrics.items_processed += 1;
                if succeeded {
                    metrics.items_succeeded += 1;
                } else {
                    metrics.items_failed += 1;
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            processed = metrics.items_processed,
            succeeded = metrics.items_succeeded,
            failed = metrics.items_failed,
            discovered = metrics.items_discovered,
            "runner finished"
        );
        Ok(metrics)
    }

    async fn process_item(
        &self,
        item: &WorkItem,
        metrics: &mut RunnerMetrics,
    ) -> Result<bool, IngestError> {
        let span = quarry_utils::logging::work_item_span(
            &item.work_item_id,
            &self.worker_id,
            &item.resource_id,
        );
        let _guard = span.enter();

        let Some(connector) = self.connectors.get(&item.source_system) else {
            warn!(source_system = %item.source_system, "no connector registered");
            self.store
                .complete_work_item(
                    &item.work_item_id,
                    WorkOutcome::Failed,
                    Some(&format!("no connector for source system '{}'", item.source_system)),
                    None,
                )
                .await?;
            return Ok(false);
        };

        let request = ConnectorRequest {
            uri: item.request_uri.clone(),
            method: item.request_method.clone(),
            headers: item.request_headers.as_ref().and_then(|v| {
                serde_json::from_value(v.clone()).ok()
            }),
            body: item.request_body.clone(),
            params: Default::default(),
        };

        let response = connector.fetch(&request).await;

        if !response.is_success() {
            let error = response
                .error_message
                .clone()
                .unwrap_or_else(|| format!("upstream returned status {}", response.status_code));
            let retry_after = if self.options.respect_retry_after {
                response.retry_after()
            } else {
                None
            };
            warn!(status_code = response.status_code, error = %error, "fetch failed");
            self.store
                .complete_work_item(&item.work_item_id, WorkOutcome::Failed, Some(&error), retry_after)
                .await?;
            return Ok(false);
        }

        let mut record = IngestRecord::from_fetch(
            item.source_system.clone(),
            item.source_name.clone(),
            item.resource_type.clone(),
            item.resource_id.clone(),
            item.request_uri.clone(),
            item.request_method.clone(),
            response.status_code,
            response.payload.clone(),
            item.attempt,
        )?;
        record.variant = item
            .variant
            .as_deref()
            .and_then(|v| v.parse().ok());
        record.duration_ms = Some(response.duration_ms);

        let rel_path = ingest_record_path(
            "ingest",
            &record.source_system,
            &record.source_name,
            &record.resource_type,
            record.fetched_at_utc.date_naive(),
            &record.ingest_id,
            "json",
        );
        let record_json = serde_json::to_value(&record).map_err(CanonicalError::from)?;
        for writer in &self.lake_writers {
            writer.write_json(&rel_path, &record_json)?;
        }

        if self.options.enable_discovery {
            for plugin in &self.discovery_plugins {
                for discovered in plugin.discover(&record) {
                    // Duplicates drop silently at the dedupe index.
                    if self.store.enqueue(&discovered).await?.accepted() {
                        metrics.items_discovered += 1;
                    }
                }
            }
        }

        self.store
            .complete_work_item(&item.work_item_id, WorkOutcome::Succeeded, None, None)
            .await?;
        Ok(true)
    }
}
