//! Store bootstrap: connection pool, schema, and shared claim plumbing.

use std::time::Duration;

use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use quarry_retry::{calculate_delay, RetryConfig};

use crate::error::StateError;

/// Requeue backoff for failed rows: exponential with jitter, honoring an
/// upstream retry-after hint when it is the larger of the two.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_seconds: f64,
    pub max_seconds: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 2.0,
            max_seconds: 300.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before a failed row becomes claimable again. `attempt` is the
    /// 1-based attempt that just failed.
    #[must_use]
    pub fn delay_for(&self, attempt: i64, retry_after: Option<Duration>) -> Duration {
        let config = RetryConfig {
            max_attempts: u32::MAX,
            initial_delay_ms: self.base_seconds * 1000.0,
            max_delay_ms: self.max_seconds * 1000.0,
            backoff_multiplier: 2.0,
            jitter: true,
        };
        let computed = calculate_delay(attempt.saturating_sub(1).max(0) as u32, &config);
        match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

/// SQLite-backed state store shared by the ingest and LLM queues.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
    pub backoff: BackoffPolicy,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    work_item_id     TEXT PRIMARY KEY,
    source_system    TEXT NOT NULL,
    source_name      TEXT NOT NULL,
    resource_type    TEXT NOT NULL,
    resource_id      TEXT NOT NULL,
    request_uri      TEXT NOT NULL,
    request_method   TEXT NOT NULL DEFAULT 'GET',
    request_headers  TEXT,
    request_body     TEXT,
    variant          TEXT,
    status           TEXT NOT NULL DEFAULT 'pending',
    priority         INTEGER NOT NULL DEFAULT 100,
    attempt          INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL DEFAULT 3,
    dedupe_key       TEXT NOT NULL,
    locked_by        TEXT,
    lock_expires_utc TEXT,
    available_utc    TEXT,
    last_error       TEXT,
    metadata         TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_work_items_dedupe
    ON work_items(dedupe_key);
CREATE INDEX IF NOT EXISTS ix_work_items_claim
    ON work_items(status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS ix_work_items_recovery
    ON work_items(status, lock_expires_utc);

CREATE TABLE IF NOT EXISTS job (
    job_id            TEXT PRIMARY KEY,
    interrogation_key TEXT NOT NULL,
    input_json        TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'queued',
    priority          INTEGER NOT NULL DEFAULT 100,
    attempt_count     INTEGER NOT NULL DEFAULT 0,
    max_attempts      INTEGER NOT NULL DEFAULT 3,
    available_utc     TEXT NOT NULL,
    locked_by         TEXT,
    lock_expires_utc  TEXT,
    model_hint        TEXT,
    dedupe_key        TEXT,
    last_error        TEXT,
    created_utc       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_job_dedupe
    ON job(dedupe_key) WHERE dedupe_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS ix_job_claim
    ON job(status, priority DESC, created_utc);
CREATE INDEX IF NOT EXISTS ix_job_recovery
    ON job(status, lock_expires_utc);

CREATE TABLE IF NOT EXISTS run (
    run_id        TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL REFERENCES job(job_id),
    status        TEXT NOT NULL,
    model_name    TEXT,
    started_utc   TEXT NOT NULL,
    completed_utc TEXT,
    metrics_json  TEXT,
    error         TEXT
);
CREATE INDEX IF NOT EXISTS ix_run_job ON run(job_id);

CREATE TABLE IF NOT EXISTS artifact (
    artifact_id       TEXT PRIMARY KEY,
    run_id            TEXT NOT NULL REFERENCES run(run_id),
    artifact_type     TEXT NOT NULL,
    lake_uri          TEXT,
    content           TEXT,
    content_mime_type TEXT,
    content_sha256    TEXT NOT NULL,
    byte_count        INTEGER NOT NULL,
    stored_in_sql     INTEGER NOT NULL DEFAULT 0,
    mirrored_to_lake  INTEGER NOT NULL DEFAULT 0,
    created_utc       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_artifact_run ON artifact(run_id);

CREATE TABLE IF NOT EXISTS evidence_bundle (
    bundle_id      TEXT PRIMARY KEY,
    run_id         TEXT REFERENCES run(run_id),
    build_version  TEXT NOT NULL,
    policy_json    TEXT NOT NULL,
    summary_json   TEXT NOT NULL,
    lake_uri       TEXT,
    bundle_json    TEXT,
    content_sha256 TEXT NOT NULL,
    created_utc    TEXT NOT NULL
);
"#;

impl StateStore {
    /// Open (creating if missing) a file-backed store and apply the schema.
    pub async fn connect(database_path: &str) -> Result<Self, StateError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            backoff: BackoffPolicy::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. Single connection: each in-memory SQLite
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, StateError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            backoff: BackoffPolicy::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StateError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("state schema initialized");
        Ok(())
    }

    /// Run a claim closure with bounded, jittered retry on busy-database
    /// errors. After the attempts are exhausted the claim reports empty via
    /// the error; workers simply poll again.
    pub(crate) async fn with_claim_retry<T, F, Fut>(&self, mut claim: F) -> Result<T, StateError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StateError>>,
    {
        const CLAIM_ATTEMPTS: u32 = 3;

        let mut last_err = None;
        for attempt in 0..CLAIM_ATTEMPTS {
            match claim().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() && attempt + 1 < CLAIM_ATTEMPTS => {
                    let jitter_ms = rand::thread_rng().gen_range(10..=50) * (attempt as u64 + 1);
                    warn!(attempt = attempt + 1, jitter_ms, "claim hit busy database, retrying");
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.expect("retry loop exits with an error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = StateStore::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let policy = BackoffPolicy {
            base_seconds: 2.0,
            max_seconds: 300.0,
        };

        for attempt in 1..=10i64 {
            let base = (2.0 * 2.0f64.powi((attempt - 1) as i32)).min(300.0);
            let delay = policy.delay_for(attempt, None).as_secs_f64();
            assert!(delay >= base * 0.75 - 1e-6 && delay <= base * 1.25 + 1e-6);
        }
    }

    #[test]
    fn retry_after_hint_wins_when_larger() {
        let policy = BackoffPolicy::default();
        let hint = Duration::from_secs(3600);
        assert_eq!(policy.delay_for(1, Some(hint)), hint);
    }

    #[test]
    fn small_retry_after_hint_is_ignored() {
        let policy = BackoffPolicy {
            base_seconds: 100.0,
            max_seconds: 300.0,
        };
        let delay = policy.delay_for(1, Some(Duration::from_millis(1)));
        assert!(delay >= Duration::from_secs(75));
    }
}
