//! LLM derivation queue operations over the `job`, `run`, `artifact`, and
//! `evidence_bundle` tables.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::error::StateError;
use crate::models::{
    ArtifactRecord, HeartbeatResult, Job, JobStatus, NewArtifact, NewJob, Run, RunStatus,
};
use crate::store::StateStore;

fn job_from_row(row: &SqliteRow) -> Result<Job, StateError> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<JobStatus>()
        .map_err(|_| StateError::InvalidColumn {
            field: "status",
            value: status_raw,
        })?;

    Ok(Job {
        job_id: row.try_get("job_id")?,
        interrogation_key: row.try_get("interrogation_key")?,
        input_json: row.try_get("input_json")?,
        status,
        priority: row.try_get("priority")?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        available_utc: row.try_get("available_utc")?,
        locked_by: row.try_get("locked_by")?,
        lock_expires_utc: row.try_get("lock_expires_utc")?,
        model_hint: row.try_get("model_hint")?,
        dedupe_key: row.try_get("dedupe_key")?,
        last_error: row.try_get("last_error")?,
        created_utc: row.try_get("created_utc")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StateError> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<RunStatus>()
        .map_err(|_| StateError::InvalidColumn {
            field: "status",
            value: status_raw,
        })?;

    Ok(Run {
        run_id: row.try_get("run_id")?,
        job_id: row.try_get("job_id")?,
        status,
        model_name: row.try_get("model_name")?,
        started_utc: row.try_get("started_utc")?,
        completed_utc: row.try_get("completed_utc")?,
        metrics_json: row.try_get("metrics_json")?,
        error: row.try_get("error")?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRecord, StateError> {
    Ok(ArtifactRecord {
        artifact_id: row.try_get("artifact_id")?,
        run_id: row.try_get("run_id")?,
        artifact_type: row.try_get("artifact_type")?,
        lake_uri: row.try_get("lake_uri")?,
        content: row.try_get("content")?,
        content_mime_type: row.try_get("content_mime_type")?,
        content_sha256: row.try_get("content_sha256")?,
        byte_count: row.try_get("byte_count")?,
        stored_in_sql: row.try_get::<i64, _>("stored_in_sql")? != 0,
        mirrored_to_lake: row.try_get::<i64, _>("mirrored_to_lake")? != 0,
        created_utc: row.try_get("created_utc")?,
    })
}

impl StateStore {
    /// Enqueue a derivation job; immediately available. A dedupe-key
    /// conflict returns the existing job's id without inserting.
    pub async fn enqueue_job(&self, new_job: &NewJob) -> Result<String, StateError> {
        let job_id = quarry_utils::ids::new_id();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO job (
                job_id, interrogation_key, input_json, status, priority,
                attempt_count, max_attempts, available_utc, model_hint,
                dedupe_key, created_utc
            ) VALUES (?, ?, ?, 'queued', ?, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(&new_job.interrogation_key)
        .bind(&new_job.input_json)
        .bind(new_job.priority)
        .bind(new_job.max_attempts)
        .bind(now)
        .bind(&new_job.model_hint)
        .bind(&new_job.dedupe_key)
        .bind(now)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(job_id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let dedupe = new_job.dedupe_key.as_deref().unwrap_or_default();
                debug!(dedupe_key = %dedupe, "duplicate job dropped");
                let row = sqlx::query("SELECT job_id FROM job WHERE dedupe_key = ?")
                    .bind(dedupe)
                    .fetch_one(self.pool())
                    .await?;
                Ok(row.try_get("job_id")?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Claim the single highest-priority claimable job for `worker_id`.
    ///
    /// Claimable: queued, available, unlocked (or lease expired), attempts
    /// remaining. A running job with an expired lease is also claimable
    /// regardless of attempt count (crash recovery); a crash on the final
    /// permitted attempt must still be reclaimed so the failure path can
    /// land it in `dead` instead of leaving it stuck in `running`.
    pub async fn claim_next_job(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StateError> {
        let worker_id = worker_id.to_string();
        self.with_claim_retry(|| {
            let worker_id = worker_id.clone();
            async move {
                let now = Utc::now();
                let expires = now + lease;

                let row = sqlx::query(
                    r#"
                    UPDATE job
                    SET status = 'running',
                        locked_by = ?,
                        lock_expires_utc = ?,
                        attempt_count = attempt_count + 1
                    WHERE job_id IN (
                        SELECT job_id FROM job
                        WHERE (
                            status = 'queued'
                            AND attempt_count < max_attempts
                            AND available_utc <= ?
                            AND (locked_by IS NULL OR lock_expires_utc IS NULL
                                 OR lock_expires_utc <= ?)
                        ) OR (
                            status = 'running'
                            AND lock_expires_utc IS NOT NULL
                            AND lock_expires_utc <= ?
                        )
                        ORDER BY priority DESC, created_utc ASC
                        LIMIT 1
                    )
                    RETURNING *
                    "#,
                )
                .bind(&worker_id)
                .bind(expires)
                .bind(now)
                .bind(now)
                .bind(now)
                .fetch_optional(self.pool())
                .await?;

                row.as_ref().map(job_from_row).transpose()
            }
        })
        .await
    }

    /// Extend a job lease while this worker still holds it.
    pub async fn heartbeat_job(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResult, StateError> {
        let result = sqlx::query(
            r#"
            UPDATE job SET lock_expires_utc = ?
            WHERE job_id = ? AND locked_by = ? AND status = 'running'
            "#,
        )
        .bind(Utc::now() + lease)
        .bind(job_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(HeartbeatResult::Ok)
        } else {
            Ok(HeartbeatResult::Lost)
        }
    }

    /// Terminal success; the lease is released.
    pub async fn mark_job_succeeded(&self, job_id: &str) -> Result<(), StateError> {
        sqlx::query(
            r#"
            UPDATE job SET status = 'succeeded', locked_by = NULL, lock_expires_utc = NULL
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a failure: requeue with backoff while attempts remain, else
    /// the job goes to `dead` and is never auto-retried.
    pub async fn mark_job_failed(
        &self,
        job_id: &str,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<JobStatus, StateError> {
        let job = self.get_job(job_id).await?.ok_or_else(|| StateError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;

        let now = Utc::now();
        if job.attempt_count < job.max_attempts {
            let delay = self.backoff.delay_for(job.attempt_count, retry_after);
            sqlx::query(
                r#"
                UPDATE job
                SET status = 'queued', locked_by = NULL, lock_expires_utc = NULL,
                    available_utc = ?, last_error = ?
                WHERE job_id = ?
                "#,
            )
            .bind(now + delay)
            .bind(error)
            .bind(job_id)
            .execute(self.pool())
            .await?;
            Ok(JobStatus::Queued)
        } else {
            sqlx::query(
                r#"
                UPDATE job
                SET status = 'dead', locked_by = NULL, lock_expires_utc = NULL,
                    last_error = ?
                WHERE job_id = ?
                "#,
            )
            .bind(error)
            .bind(job_id)
            .execute(self.pool())
            .await?;
            Ok(JobStatus::Dead)
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StateError> {
        let row = sqlx::query("SELECT * FROM job WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StateError> {
        let rows = sqlx::query("SELECT * FROM job ORDER BY created_utc DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn job_stats(&self) -> Result<BTreeMap<String, i64>, StateError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job GROUP BY status")
            .fetch_all(self.pool())
            .await?;

        let mut stats = BTreeMap::new();
        for row in rows {
            stats.insert(row.try_get::<String, _>("status")?, row.try_get::<i64, _>("n")?);
        }
        Ok(stats)
    }

    /// Open a run for a claimed job. Runs are append-only from here on.
    pub async fn create_run(
        &self,
        job_id: &str,
        model_name: Option<&str>,
    ) -> Result<String, StateError> {
        let run_id = quarry_utils::ids::new_id();
        sqlx::query(
            r#"
            INSERT INTO run (run_id, job_id, status, model_name, started_utc)
            VALUES (?, ?, 'running', ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(job_id)
        .bind(model_name)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(run_id)
    }

    /// Close a run with its final status, metrics, and error.
    pub async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        metrics_json: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        if status == RunStatus::Running {
            return Err(StateError::InvalidTransition {
                from: "running".to_string(),
                to: "running".to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE run
            SET status = ?, completed_utc = ?, metrics_json = ?, error = ?
            WHERE run_id = ? AND status = 'running'
            "#,
        )
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(metrics_json)
        .bind(error)
        .bind(run_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn runs_for_job(&self, job_id: &str) -> Result<Vec<Run>, StateError> {
        let rows = sqlx::query("SELECT * FROM run WHERE job_id = ? ORDER BY started_utc DESC")
            .bind(job_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Record an artifact. The storage policy invariant is enforced here:
    /// at least one of SQL/lake, lake mirror implies a URI, SQL storage
    /// implies inline content.
    pub async fn create_artifact(&self, artifact: &NewArtifact) -> Result<String, StateError> {
        if !artifact.stored_in_sql && !artifact.mirrored_to_lake {
            return Err(StateError::ArtifactPolicy {
                reason: "artifact must be stored in SQL, mirrored to lake, or both".to_string(),
            });
        }
        if artifact.mirrored_to_lake && artifact.lake_uri.is_none() {
            return Err(StateError::ArtifactPolicy {
                reason: "mirrored_to_lake requires lake_uri".to_string(),
            });
        }
        if artifact.stored_in_sql && artifact.content.is_none() {
            return Err(StateError::ArtifactPolicy {
                reason: "stored_in_sql requires inline content".to_string(),
            });
        }

        let artifact_id = quarry_utils::ids::new_id();
        sqlx::query(
            r#"
            INSERT INTO artifact (
                artifact_id, run_id, artifact_type, lake_uri, content,
                content_mime_type, content_sha256, byte_count,
                stored_in_sql, mirrored_to_lake, created_utc
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact_id)
        .bind(&artifact.run_id)
        .bind(&artifact.artifact_type)
        .bind(&artifact.lake_uri)
        .bind(&artifact.content)
        .bind(&artifact.content_mime_type)
        .bind(&artifact.content_sha256)
        .bind(artifact.byte_count)
        .bind(artifact.stored_in_sql as i64)
        .bind(artifact.mirrored_to_lake as i64)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(artifact_id)
    }

    pub async fn artifacts_for_run(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, StateError> {
        let rows = sqlx::query("SELECT * FROM artifact WHERE run_id = ? ORDER BY created_utc")
            .bind(run_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    /// Record an evidence bundle, optionally with its full JSON inline.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_evidence_bundle(
        &self,
        bundle_id: &str,
        run_id: Option<&str>,
        build_version: &str,
        policy_json: &str,
        summary_json: &str,
        lake_uri: Option<&str>,
        bundle_json: Option<&str>,
        content_sha256: &str,
    ) -> Result<(), StateError> {
        sqlx::query(
            r#"
            INSERT INTO evidence_bundle (
                bundle_id, run_id, build_version, policy_json, summary_json,
                lake_uri, bundle_json, content_sha256, created_utc
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(bundle_id)
        .bind(run_id)
        .bind(build_version)
        .bind(policy_json)
        .bind(summary_json)
        .bind(lake_uri)
        .bind(bundle_json)
        .bind(content_sha256)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(key: &str) -> NewJob {
        NewJob::new(key, r#"{"entity_type":"character","entity_id":"luke"}"#)
    }

    #[tokio::test]
    async fn enqueue_and_claim_round_trip() {
        let store = StateStore::in_memory().await.unwrap();
        let job_id = store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();

        let claimed = store
            .claim_next_job("worker-1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let store = StateStore::in_memory().await.unwrap();
        assert!(store
            .claim_next_job("w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dedupe_key_makes_enqueue_idempotent() {
        let store = StateStore::in_memory().await.unwrap();
        let mut job = new_job("entity_facts_v1");
        job.dedupe_key = Some("entity_facts_v1:character:luke".to_string());

        let first = store.enqueue_job(&job).await.unwrap();
        let second = store.enqueue_job(&job).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.job_stats().await.unwrap().get("queued"), Some(&1));
    }

    #[tokio::test]
    async fn lease_expiry_hands_job_to_second_worker() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();

        let a = store
            .claim_next_job("a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.attempt_count, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let b = store
            .claim_next_job("b", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.job_id, a.job_id);
        assert_eq!(b.attempt_count, 2);
    }

    #[tokio::test]
    async fn held_lease_blocks_other_workers() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();

        store.claim_next_job("a", Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(store
            .claim_next_job("b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn crash_on_final_attempt_recovers_into_dead() {
        // Lease expiry on the last permitted attempt: the job must remain
        // reclaimable so the failure path can terminalize it, rather than
        // sticking in running forever.
        let store = StateStore::in_memory().await.unwrap();
        let mut job = new_job("entity_facts_v1");
        job.max_attempts = 1;
        let job_id = store.enqueue_job(&job).await.unwrap();

        let first = store
            .claim_next_job("a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attempt_count, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let recovered = store
            .claim_next_job("b", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.job_id, job_id);
        assert_eq!(recovered.attempt_count, 2);

        let status = store.mark_job_failed(&job_id, "crashed mid-run", None).await.unwrap();
        assert_eq!(status, JobStatus::Dead);
        assert!(store
            .claim_next_job("c", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failure_requeues_then_dead() {
        let store = StateStore::in_memory().await.unwrap();
        let mut job = new_job("entity_facts_v1");
        job.max_attempts = 2;
        let job_id = store.enqueue_job(&job).await.unwrap();

        store.claim_next_job("w", Duration::from_secs(60)).await.unwrap().unwrap();
        let status = store.mark_job_failed(&job_id, "first failure", None).await.unwrap();
        assert_eq!(status, JobStatus::Queued);

        // Make it immediately available again.
        sqlx::query("UPDATE job SET available_utc = ? WHERE job_id = ?")
            .bind(Utc::now())
            .bind(&job_id)
            .execute(store.pool())
            .await
            .unwrap();

        let second = store.claim_next_job("w", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(second.attempt_count, 2);

        let status = store.mark_job_failed(&job_id, "second failure", None).await.unwrap();
        assert_eq!(status, JobStatus::Dead);

        // Dead jobs are never claimable again.
        assert!(store
            .claim_next_job("w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("second failure"));
    }

    #[tokio::test]
    async fn runs_and_artifacts_attach_to_job() {
        let store = StateStore::in_memory().await.unwrap();
        let job_id = store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();
        store.claim_next_job("w", Duration::from_secs(60)).await.unwrap().unwrap();

        let run_id = store.create_run(&job_id, Some("llama3.2")).await.unwrap();

        let artifact = NewArtifact {
            run_id: run_id.clone(),
            artifact_type: "response_json".to_string(),
            lake_uri: Some("llm_runs/2026/02/21/run/response_json.json".to_string()),
            content: Some(r#"{"answer":42}"#.to_string()),
            content_mime_type: Some("application/json".to_string()),
            content_sha256: "a".repeat(64),
            byte_count: 13,
            stored_in_sql: true,
            mirrored_to_lake: true,
        };
        store.create_artifact(&artifact).await.unwrap();

        store
            .complete_run(&run_id, RunStatus::Succeeded, Some(r#"{"tokens":10}"#), None)
            .await
            .unwrap();
        store.mark_job_succeeded(&job_id).await.unwrap();

        let runs = store.runs_for_job(&job_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert!(runs[0].completed_utc.is_some());

        let artifacts = store.artifacts_for_run(&run_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].stored_in_sql);
        assert!(artifacts[0].mirrored_to_lake);

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn artifact_policy_is_enforced() {
        let store = StateStore::in_memory().await.unwrap();
        let job_id = store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();
        let run_id = store.create_run(&job_id, None).await.unwrap();

        let neither = NewArtifact {
            run_id: run_id.clone(),
            artifact_type: "output_json".to_string(),
            lake_uri: None,
            content: None,
            content_mime_type: None,
            content_sha256: "b".repeat(64),
            byte_count: 0,
            stored_in_sql: false,
            mirrored_to_lake: false,
        };
        assert!(matches!(
            store.create_artifact(&neither).await,
            Err(StateError::ArtifactPolicy { .. })
        ));

        let lake_without_uri = NewArtifact {
            mirrored_to_lake: true,
            ..neither.clone()
        };
        assert!(matches!(
            store.create_artifact(&lake_without_uri).await,
            Err(StateError::ArtifactPolicy { .. })
        ));

        let sql_without_content = NewArtifact {
            stored_in_sql: true,
            mirrored_to_lake: false,
            ..neither
        };
        assert!(matches!(
            store.create_artifact(&sql_without_content).await,
            Err(StateError::ArtifactPolicy { .. })
        ));
    }

    #[tokio::test]
    async fn evidence_bundle_rows_persist() {
        let store = StateStore::in_memory().await.unwrap();
        let job_id = store.enqueue_job(&new_job("entity_facts_v1")).await.unwrap();
        let run_id = store.create_run(&job_id, None).await.unwrap();

        store
            .create_evidence_bundle(
                "bundle-1",
                Some(&run_id),
                "2.0",
                r#"{"max_items":50}"#,
                r#"{"item_count":1}"#,
                None,
                Some(r#"{"items":[]}"#),
                &"c".repeat(64),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn priority_orders_job_claims() {
        let store = StateStore::in_memory().await.unwrap();

        let low = new_job("entity_facts_v1");
        let mut high = new_job("page_classification_v1");
        high.priority = 200;

        store.enqueue_job(&low).await.unwrap();
        let high_id = store.enqueue_job(&high).await.unwrap();

        let claimed = store.claim_next_job("w", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, high_id);
    }
}
