//! Ingest queue operations over the `work_items` table.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::error::StateError;
use crate::models::{
    EnqueueResult, HeartbeatResult, WorkItem, WorkItemStatus, WorkOutcome,
};
use crate::store::StateStore;

fn work_item_from_row(row: &SqliteRow) -> Result<WorkItem, StateError> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<WorkItemStatus>()
        .map_err(|_| StateError::InvalidColumn {
            field: "status",
            value: status_raw,
        })?;

    let metadata_raw: String = row.try_get("metadata")?;
    let metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_raw).unwrap_or_default();

    let headers_raw: Option<String> = row.try_get("request_headers")?;
    let request_headers = headers_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(WorkItem {
        work_item_id: row.try_get("work_item_id")?,
        source_system: row.try_get("source_system")?,
        source_name: row.try_get("source_name")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        request_uri: row.try_get("request_uri")?,
        request_method: row.try_get("request_method")?,
        request_headers,
        request_body: row.try_get("request_body")?,
        variant: row.try_get("variant")?,
        status,
        priority: row.try_get("priority")?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        dedupe_key: row.try_get("dedupe_key")?,
        locked_by: row.try_get("locked_by")?,
        lock_expires_utc: row.try_get("lock_expires_utc")?,
        available_utc: row.try_get("available_utc")?,
        last_error: row.try_get("last_error")?,
        metadata,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl StateStore {
    /// Insert a work item; a dedupe-key conflict reports `Duplicate`
    /// without raising. Row counts are stable under replay.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<EnqueueResult, StateError> {
        let metadata = serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".to_string());
        let headers = item
            .request_headers
            .as_ref()
            .map(|h| h.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO work_items (
                work_item_id, source_system, source_name, resource_type, resource_id,
                request_uri, request_method, request_headers, request_body, variant,
                status, priority, attempt, max_attempts, dedupe_key,
                metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.work_item_id)
        .bind(&item.source_system)
        .bind(&item.source_name)
        .bind(&item.resource_type)
        .bind(&item.resource_id)
        .bind(&item.request_uri)
        .bind(&item.request_method)
        .bind(headers)
        .bind(&item.request_body)
        .bind(&item.variant)
        .bind(item.status.to_string())
        .bind(item.priority)
        .bind(item.attempt)
        .bind(item.max_attempts)
        .bind(&item.dedupe_key)
        .bind(metadata)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(EnqueueResult::Enqueued),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(dedupe_key = %item.dedupe_key, "duplicate work item dropped");
                Ok(EnqueueResult::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Claim up to `limit` work items for `worker_id` under a lease.
    ///
    /// Eligible rows: pending and available, or in-progress with an expired
    /// lease (crash recovery). Highest priority first, oldest first within
    /// a priority. The single UPDATE…RETURNING statement is atomic, so a
    /// row goes to at most one claimer per lease window.
    pub async fn claim_work_items(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<WorkItem>, StateError> {
        let worker_id = worker_id.to_string();
        self.with_claim_retry(|| {
            let worker_id = worker_id.clone();
            async move {
                let now = Utc::now();
                let expires = now + lease;

                let rows = sqlx::query(
                    r#"
                    UPDATE work_items
                    SET status = 'in_progress',
                        locked_by = ?,
                        lock_expires_utc = ?,
                        attempt = attempt + 1,
                        updated_at = ?
                    WHERE work_item_id IN (
                        SELECT work_item_id FROM work_items
                        WHERE (
                            status = 'pending'
                            AND (available_utc IS NULL OR available_utc <= ?)
                        ) OR (
                            status = 'in_progress'
                            AND lock_expires_utc IS NOT NULL
                            AND lock_expires_utc <= ?
                        )
                        ORDER BY priority DESC, created_at ASC
                        LIMIT ?
                    )
                    RETURNING *
                    "#,
                )
                .bind(&worker_id)
                .bind(expires)
                .bind(now)
                .bind(now)
                .bind(now)
                .bind(limit)
                .fetch_all(self.pool())
                .await?;

                rows.iter().map(work_item_from_row).collect()
            }
        })
        .await
    }

    /// Extend the lease, but only while this worker still owns the row.
    pub async fn heartbeat_work_item(
        &self,
        work_item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResult, StateError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET lock_expires_utc = ?, updated_at = ?
            WHERE work_item_id = ? AND locked_by = ? AND status = 'in_progress'
            "#,
        )
        .bind(now + lease)
        .bind(now)
        .bind(work_item_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(HeartbeatResult::Ok)
        } else {
            Ok(HeartbeatResult::Lost)
        }
    }

    /// Report the outcome of a claimed work item. Failure requeues with
    /// backoff while attempts remain, else lands in terminal `failed`.
    pub async fn complete_work_item(
        &self,
        work_item_id: &str,
        outcome: WorkOutcome,
        error: Option<&str>,
        retry_after: Option<Duration>,
    ) -> Result<WorkItemStatus, StateError> {
        let now = Utc::now();

        let new_status = match outcome {
            WorkOutcome::Succeeded => WorkItemStatus::Completed,
            WorkOutcome::Skipped => WorkItemStatus::Skipped,
            WorkOutcome::Failed => {
                let item = self
                    .get_work_item(work_item_id)
                    .await?
                    .ok_or_else(|| StateError::NotFound {
                        entity: "work_item",
                        id: work_item_id.to_string(),
                    })?;

                if item.attempt < item.max_attempts {
                    let delay = self.backoff.delay_for(item.attempt, retry_after);
                    let available: DateTime<Utc> = now + delay;
                    sqlx::query(
                        r#"
                        UPDATE work_items
                        SET status = 'pending', locked_by = NULL, lock_expires_utc = NULL,
                            available_utc = ?, last_error = ?, updated_at = ?
                        WHERE work_item_id = ?
                        "#,
                    )
                    .bind(available)
                    .bind(error)
                    .bind(now)
                    .bind(work_item_id)
                    .execute(self.pool())
                    .await?;
                    return Ok(WorkItemStatus::Pending);
                }
                WorkItemStatus::Failed
            }
        };

        sqlx::query(
            r#"
            UPDATE work_items
            SET status = ?, locked_by = NULL, lock_expires_utc = NULL,
                last_error = ?, updated_at = ?
            WHERE work_item_id = ?
            "#,
        )
        .bind(new_status.to_string())
        .bind(error)
        .bind(now)
        .bind(work_item_id)
        .execute(self.pool())
        .await?;

        Ok(new_status)
    }

    pub async fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>, StateError> {
        let row = sqlx::query("SELECT * FROM work_items WHERE work_item_id = ?")
            .bind(work_item_id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(work_item_from_row).transpose()
    }

    pub async fn work_item_exists(&self, dedupe_key: &str) -> Result<bool, StateError> {
        let row = sqlx::query("SELECT 1 FROM work_items WHERE dedupe_key = ?")
            .bind(dedupe_key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    pub async fn count_work_items_for_source(&self, source_name: &str) -> Result<i64, StateError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM work_items WHERE source_name = ?")
            .bind(source_name)
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Count-by-status. A read-only aggregate; never blocks claimers.
    pub async fn work_item_stats(&self) -> Result<BTreeMap<String, i64>, StateError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM work_items GROUP BY status")
            .fetch_all(self.pool())
            .await?;

        let mut stats = BTreeMap::new();
        for row in rows {
            stats.insert(row.try_get::<String, _>("status")?, row.try_get::<i64, _>("n")?);
        }
        Ok(stats)
    }

    /// Admin: force every non-terminal item of a source to `failed`.
    pub async fn mark_source_failed(
        &self,
        source_name: &str,
        reason: &str,
    ) -> Result<u64, StateError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'failed', locked_by = NULL, lock_expires_utc = NULL,
                last_error = ?, updated_at = ?
            WHERE source_name = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(source_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Admin: clear backoff windows so pending rows are claimable now.
    pub async fn reset_pending_availability(&self) -> Result<u64, StateError> {
        let result = sqlx::query(
            "UPDATE work_items SET available_utc = NULL WHERE status = 'pending'",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Admin: return completed items of a source to `pending` for a re-run.
    pub async fn reset_completed_to_pending(&self, source_name: &str) -> Result<u64, StateError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'pending', attempt = 0, locked_by = NULL,
                lock_expires_utc = NULL, available_utc = NULL, last_error = NULL,
                updated_at = ?
            WHERE source_name = ? AND status = 'completed'
            "#,
        )
        .bind(now)
        .bind(source_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(resource_id: &str) -> WorkItem {
        WorkItem::new(
            "test",
            "test_source",
            "item",
            resource_id,
            format!("https://example.com/{resource_id}"),
        )
    }

    #[tokio::test]
    async fn enqueue_then_duplicate() {
        let store = StateStore::in_memory().await.unwrap();

        let first = item("dup_test");
        assert_eq!(store.enqueue(&first).await.unwrap(), EnqueueResult::Enqueued);

        // Same dedupe key, fresh row id: still a duplicate.
        let second = item("dup_test");
        assert_eq!(store.enqueue(&second).await.unwrap(), EnqueueResult::Duplicate);
        assert_eq!(store.count_work_items_for_source("test_source").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_keeps_row_counts_stable() {
        let store = StateStore::in_memory().await.unwrap();
        let items: Vec<WorkItem> = (0..5).map(|i| item(&format!("stable_{i}"))).collect();

        for it in &items {
            assert!(store.enqueue(it).await.unwrap().accepted());
        }
        let after_first = store.count_work_items_for_source("test_source").await.unwrap();
        assert_eq!(after_first, 5);

        let mut duplicates = 0;
        for it in &items {
            if store.enqueue(it).await.unwrap() == EnqueueResult::Duplicate {
                duplicates += 1;
            }
        }
        assert_eq!(duplicates, 5);
        assert_eq!(store.count_work_items_for_source("test_source").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = StateStore::in_memory().await.unwrap();

        let low = item("low");
        let mut high = item("high");
        high.priority = 200;
        store.enqueue(&low).await.unwrap();
        store.enqueue(&high).await.unwrap();

        let claimed = store
            .claim_work_items("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].resource_id, "high");
        assert_eq!(claimed[0].status, WorkItemStatus::InProgress);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn claimed_row_is_invisible_to_second_claimer() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue(&item("solo")).await.unwrap();

        let a = store.claim_work_items("a", 10, Duration::from_secs(60)).await.unwrap();
        let b = store.claim_work_items("b", 10, Duration::from_secs(60)).await.unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_with_attempt_bump() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue(&item("lease")).await.unwrap();

        let a = store
            .claim_work_items("a", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(a[0].attempt, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let b = store.claim_work_items("b", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].attempt, 2);
        assert_eq!(b[0].locked_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn crash_on_final_attempt_is_still_reclaimable() {
        // A worker that dies holding the last permitted attempt must not
        // strand the row in in_progress: recovery ignores attempt counts,
        // and the next completion lands it in terminal failed.
        let store = StateStore::in_memory().await.unwrap();
        let mut it = item("final_crash");
        it.max_attempts = 1;
        store.enqueue(&it).await.unwrap();

        let a = store
            .claim_work_items("a", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(a[0].attempt, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let b = store.claim_work_items("b", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].attempt, 2);

        let status = store
            .complete_work_item(&b[0].work_item_id, WorkOutcome::Failed, Some("crashed"), None)
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Failed);
    }

    #[tokio::test]
    async fn heartbeat_lost_after_steal() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue(&item("steal")).await.unwrap();

        let a = store
            .claim_work_items("a", 1, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.claim_work_items("b", 1, Duration::from_secs(60)).await.unwrap();

        let hb = store
            .heartbeat_work_item(&a[0].work_item_id, "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(hb, HeartbeatResult::Lost);

        let hb_b = store
            .heartbeat_work_item(&a[0].work_item_id, "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(hb_b, HeartbeatResult::Ok);
    }

    #[tokio::test]
    async fn failure_requeues_until_attempts_exhausted() {
        let store = StateStore::in_memory().await.unwrap();
        let mut it = item("flaky");
        it.max_attempts = 2;
        store.enqueue(&it).await.unwrap();

        let claimed = store.claim_work_items("w", 1, Duration::from_secs(60)).await.unwrap();
        let status = store
            .complete_work_item(&claimed[0].work_item_id, WorkOutcome::Failed, Some("boom"), None)
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Pending);

        // Second failure exhausts max_attempts = 2.
        let reloaded = store.get_work_item(&claimed[0].work_item_id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_error.as_deref(), Some("boom"));

        // Make it claimable immediately for the test.
        sqlx::query("UPDATE work_items SET available_utc = NULL WHERE work_item_id = ?")
            .bind(&claimed[0].work_item_id)
            .execute(store.pool())
            .await
            .unwrap();

        let again = store.claim_work_items("w", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again[0].attempt, 2);
        let status = store
            .complete_work_item(&again[0].work_item_id, WorkOutcome::Failed, Some("boom2"), None)
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Failed);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let store = StateStore::in_memory().await.unwrap();
        for i in 0..3 {
            store.enqueue(&item(&format!("stats_{i}"))).await.unwrap();
        }

        let stats = store.work_item_stats().await.unwrap();
        assert_eq!(stats.get("pending"), Some(&3));
    }

    #[tokio::test]
    async fn admin_resets() {
        let store = StateStore::in_memory().await.unwrap();
        store.enqueue(&item("admin")).await.unwrap();

        let claimed = store.claim_work_items("w", 1, Duration::from_secs(60)).await.unwrap();
        store
            .complete_work_item(&claimed[0].work_item_id, WorkOutcome::Succeeded, None, None)
            .await
            .unwrap();

        let reset = store.reset_completed_to_pending("test_source").await.unwrap();
        assert_eq!(reset, 1);
        let reloaded = store.get_work_item(&claimed[0].work_item_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, WorkItemStatus::Pending);
        assert_eq!(reloaded.attempt, 0);

        let failed = store.mark_source_failed("test_source", "manual").await.unwrap();
        assert_eq!(failed, 1);
    }
}
