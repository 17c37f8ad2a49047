//! The dispatch loop.
//!
//! claim → create run → resolve handler → invoke under timeout → persist
//! artifacts per storage policy → mark run and job. Heartbeats run beside
//! the handler so a slow LLM call cannot silently lose the lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use quarry_lake::{llm_artifact_path, FileLakeWriter, LakeError};
use quarry_state::{Job, NewArtifact, RunStatus, StateError, StateStore};
use quarry_utils::canonical::{canonicalize, sha256_hex};
use quarry_utils::error::CanonicalError;

use crate::context::{ExecutionMode, RunContext};
use crate::handler::{ArtifactContent, ArtifactSpec, HandlerResult, JobHandler};
use crate::registry::{infer_job_type, JobTypeRegistry};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("lake error: {0}")]
    Lake(#[from] LakeError),

    #[error("canonicalization error: {0}")]
    Canonical(#[from] CanonicalError),
}

/// Dispatcher-level configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub dry_run: bool,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    pub default_model: String,
}

impl DispatcherConfig {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            worker_id: worker_id.into(),
            dry_run,
            poll_interval: Duration::from_secs(10),
            lease: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            default_model: "llama3.2".to_string(),
        }
    }

    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        }
    }
}

pub struct JobDispatcher {
    config: DispatcherConfig,
    store: StateStore,
    lake: FileLakeWriter,
    registry: JobTypeRegistry,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobDispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        store: StateStore,
        lake: FileLakeWriter,
        registry: JobTypeRegistry,
    ) -> Self {
        Self {
            config,
            store,
            lake,
            registry,
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Wire a handler for a job type. All registration happens before the
    /// loop starts; the map is never mutated afterwards.
    pub fn register_handler(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    #[must_use]
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Claim and process at most one job. Returns whether a job was
    /// processed (false = queue idle).
    pub async fn dispatch_once(&self) -> Result<bool, DispatchError> {
        let Some(job) = self
            .store
            .claim_next_job(&self.config.worker_id, self.config.lease)
            .await?
        else {
            return Ok(false);
        };

        self.process_job(job).await?;
        Ok(true)
    }

    /// Poll until shutdown. Finishes the in-flight job before exiting.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        info!(
            worker_id = %self.config.worker_id,
            execution_mode = %self.config.execution_mode().as_str(),
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.config.worker_id, "dispatcher draining");
                return Ok(());
            }

            match self.dispatch_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    // Infrastructure failure: abandon the claim (the lease
                    // recovers it) and keep polling.
                    error!(worker_id = %self.config.worker_id, error = %err, "dispatch error");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn process_job(&self, job: Job) -> Result<(), DispatchError> {
        let job_type = infer_job_type(&self.registry, &job.interrogation_key);
        let model = job
            .model_hint
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let run_id = self.store.create_run(&job.job_id, Some(&model)).await?;
        let ctx = RunContext::create(
            job.job_id.clone(),
            run_id.clone(),
            self.config.worker_id.clone(),
            job_type.clone(),
            job.attempt_count,
            job.max_attempts,
            self.config.execution_mode(),
        );
        let span = ctx.span();
        let _guard = span.enter();
        info!(interrogation_key = %job.interrogation_key, "processing job");

        let Some(handler) = self.handlers.get(&job_type) else {
            let error = format!("no handler registered for job type '{job_type}'");
            warn!(error = %error, "handler resolution failed");
            self.store
                .complete_run(&run_id, RunStatus::Failed, None, Some(&error))
                .await?;
            self.store.mark_job_failed(&job.job_id, &error, None).await?;
            return Ok(());
        };

        let timeout = self
            .registry
            .get(&job_type)
            .map(|d| Duration::from_secs(d.timeout_seconds))
            .unwrap_or(Duration::from_secs(300));

        let result = self.invoke_with_heartbeat(handler.as_ref(), &job, &ctx, timeout).await;

        match result {
            HandlerResult::Succeeded {
                output: _,
                metrics,
                artifacts,
                evidence_bundle,
            } => {
                for spec in &artifacts {
                    self.persist_artifact(&run_id, spec).await?;
                }
                if let Some(bundle) = &evidence_bundle {
                    self.persist_evidence_bundle(&run_id, bundle).await?;
                }

                let metrics_json = if metrics.is_null() {
                    None
                } else {
                    Some(metrics.to_string())
                };
                self.store
                    .complete_run(&run_id, RunStatus::Succeeded, metrics_json.as_deref(), None)
                    .await?;
                self.store.mark_job_succeeded(&job.job_id).await?;
                info!(artifact_count = artifacts.len(), "job succeeded");
            }
            HandlerResult::Skipped { reason } => {
                // The skip is the outcome; the job is done.
                self.store
                    .complete_run(
                        &run_id,
                        RunStatus::Skipped,
                        Some(&serde_json::json!({"skip_reason": reason}).to_string()),
                        None,
                    )
                    .await?;
                self.store.mark_job_succeeded(&job.job_id).await?;
                info!(reason = %reason, "job skipped");
            }
            HandlerResult::Failed {
                error,
                validation_errors,
            } => {
                let full_error = if validation_errors.is_empty() {
                    error
                } else {
                    format!("{error}; details: {}", validation_errors.join(" | "))
                };
                self.store
                    .complete_run(&run_id, RunStatus::Failed, None, Some(&full_error))
                    .await?;
                let status = self.store.mark_job_failed(&job.job_id, &full_error, None).await?;
                warn!(status = %status, error = %full_error, "job failed");
            }
        }

        Ok(())
    }

    /// Drive the handler under its timeout, heartbeating the lease while
    /// it runs. A timeout is an ordinary failure with normal retry.
    async fn invoke_with_heartbeat(
        &self,
        handler: &dyn JobHandler,
        job: &Job,
        ctx: &RunContext,
        timeout: Duration,
    ) -> HandlerResult {
        let handler_fut = tokio::time::timeout(timeout, handler.handle(job, ctx));
        tokio::pin!(handler_fut);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                outcome = &mut handler_fut => {
                    return match outcome {
                        Ok(result) => result,
                        Err(_) => HandlerResult::failed("timeout"),
                    };
                }
                _ = heartbeat.tick() => {
                    let _ = self
                        .store
                        .heartbeat_job(&job.job_id, &self.config.worker_id, self.config.lease)
                        .await;
                }
            }
        }
    }

    async fn persist_artifact(&self, run_id: &str, spec: &ArtifactSpec) -> Result<(), DispatchError> {
        let (bytes, mime, ext) = match &spec.content {
            ArtifactContent::Json(value) => (
                canonicalize(value)?.into_bytes(),
                "application/json",
                "json",
            ),
            ArtifactContent::Text(text) => (text.clone().into_bytes(), "text/plain", "txt"),
        };
        let content_sha256 = sha256_hex(&bytes);
        let byte_count = bytes.len() as i64;

        let lake_uri = if spec.mirrored_to_lake {
            let rel_path =
                llm_artifact_path(Utc::now().date_naive(), run_id, &spec.artifact_type, ext);
            let receipt = self.lake.write_bytes(&rel_path, &bytes)?;
            Some(receipt.lake_uri)
        } else {
            None
        };

        let content = if spec.stored_in_sql {
            Some(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            None
        };

        self.store
            .create_artifact(&NewArtifact {
                run_id: run_id.to_string(),
                artifact_type: spec.artifact_type.clone(),
                lake_uri,
                content,
                content_mime_type: Some(mime.to_string()),
                content_sha256,
                byte_count,
                stored_in_sql: spec.stored_in_sql,
                mirrored_to_lake: spec.mirrored_to_lake,
            })
            .await?;
        Ok(())
    }

    async fn persist_evidence_bundle(
        &self,
        run_id: &str,
        bundle: &quarry_evidence::EvidenceBundle,
    ) -> Result<(), DispatchError> {
        let bundle_json = bundle.to_bundle_json()?;
        let policy_json = canonicalize(&bundle.policy)?;
        let summary_json = canonicalize(&bundle.summary)?;

        let rel_path = llm_artifact_path(Utc::now().date_naive(), run_id, "evidence_bundle", "json");
        let lake_uri = self.lake.write_bytes(&rel_path, bundle_json.as_bytes())?.lake_uri;

        self.store
            .create_evidence_bundle(
                &bundle.bundle_id,
                Some(run_id),
                &bundle.build_version,
                &policy_json,
                &summary_json,
                Some(&lake_uri),
                Some(&bundle_json),
                &bundle.content_sha256,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use quarry_state::{JobStatus, NewJob};
    use serde_json::json;
    use tempfile::TempDir;

    struct FixedHandler {
        result: fn() -> HandlerResult,
    }

    #[async_trait]
    impl JobHandler for FixedHandler {
        async fn handle(&self, _job: &Job, _ctx: &RunContext) -> HandlerResult {
            (self.result)()
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job, _ctx: &RunContext) -> HandlerResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HandlerResult::succeeded(json!({}))
        }
    }

    async fn dispatcher_with(
        handler: Arc<dyn JobHandler>,
        dry_run: bool,
    ) -> (TempDir, StateStore, JobDispatcher) {
        let store = StateStore::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let lake = FileLakeWriter::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        );
        let mut registry = JobTypeRegistry::with_builtins();
        // Short timeout for the timeout test.
        let mut definition = registry.get("page_classification").unwrap().clone();
        definition.timeout_seconds = 1;
        registry.register(definition);

        let mut dispatcher = JobDispatcher::new(
            DispatcherConfig::new("test-worker", dry_run),
            store.clone(),
            lake,
            registry,
        );
        dispatcher.register_handler("page_classification", handler);
        (dir, store, dispatcher)
    }

    async fn enqueue_classification(store: &StateStore) -> String {
        store
            .enqueue_job(&NewJob::new(
                "page_classification_v1",
                json!({"entity_type": "page", "entity_id": "Tatooine"}).to_string(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn idle_queue_dispatches_nothing() {
        let (_dir, _store, dispatcher) =
            dispatcher_with(Arc::new(FixedHandler { result: || HandlerResult::succeeded(json!({})) }), false).await;

        assert!(!dispatcher.dispatch_once().await.unwrap());
    }

    #[tokio::test]
    async fn success_marks_run_and_job() {
        let (_dir, store, dispatcher) = dispatcher_with(
            Arc::new(FixedHandler {
                result: || HandlerResult::Succeeded {
                    output: json!({"handled": true}),
                    metrics: json!({"total_tokens": 30}),
                    artifacts: vec![ArtifactSpec::json_dual("output_json", json!({"handled": true}))],
                    evidence_bundle: None,
                },
            }),
            false,
        )
        .await;
        let job_id = enqueue_classification(&store).await;

        assert!(dispatcher.dispatch_once().await.unwrap());

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);

        let runs = store.runs_for_job(&job_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert!(runs[0].metrics_json.as_deref().unwrap().contains("total_tokens"));

        let artifacts = store.artifacts_for_run(&runs[0].run_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].stored_in_sql && artifacts[0].mirrored_to_lake);
        assert!(artifacts[0].lake_uri.is_some());
    }

    #[tokio::test]
    async fn failure_requeues_with_error() {
        let (_dir, store, dispatcher) = dispatcher_with(
            Arc::new(FixedHandler {
                result: || HandlerResult::failed("handler exploded"),
            }),
            false,
        )
        .await;
        let job_id = enqueue_classification(&store).await;

        dispatcher.dispatch_once().await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued); // attempts remain
        assert_eq!(job.last_error.as_deref(), Some("handler exploded"));

        let runs = store.runs_for_job(&job_id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn skip_closes_job_as_succeeded() {
        let (_dir, store, dispatcher) = dispatcher_with(
            Arc::new(FixedHandler {
                result: || HandlerResult::skipped("nothing to derive"),
            }),
            false,
        )
        .await;
        let job_id = enqueue_classification(&store).await;

        dispatcher.dispatch_once().await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);

        let runs = store.runs_for_job(&job_id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Skipped);
        assert!(runs[0].metrics_json.as_deref().unwrap().contains("nothing to derive"));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job() {
        let (_dir, store, dispatcher) = dispatcher_with(
            Arc::new(FixedHandler { result: || HandlerResult::succeeded(json!({})) }),
            false,
        )
        .await;
        let job_id = store
            .enqueue_job(&NewJob::new("unregistered_key_v1", "{}"))
            .await
            .unwrap();

        dispatcher.dispatch_once().await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_and_fails() {
        let (_dir, store, dispatcher) = dispatcher_with(Arc::new(SlowHandler), false).await;
        let job_id = enqueue_classification(&store).await;

        dispatcher.dispatch_once().await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn dry_run_mode_reaches_handlers() {
        let (_dir, store, dispatcher) = dispatcher_with(
            Arc::new(FixedHandler {
                result: || HandlerResult::succeeded(json!({"status": "DRY-RUN"})),
            }),
            true,
        )
        .await;
        assert_eq!(dispatcher.config().execution_mode(), ExecutionMode::DryRun);

        let job_id = enqueue_classification(&store).await;
        dispatcher.dispatch_once().await.unwrap();

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
}
