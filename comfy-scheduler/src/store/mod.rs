//! The job store: a SQLite-backed table of job rows with lease-based
//! ownership, priority ordering and retry accounting.
//!
//! Semantics are ported from the Python agent's `db_manager.py`, with two
//! deliberate corrections (see DESIGN.md): lease recovery compares real
//! `DateTime<Utc>` values instead of lexicographic ISO-8601 strings, and
//! there is exactly one terminal "not going to run again" representation
//! (`JobStatus::Failed`) rather than a second ad hoc `cancelled` value.

pub mod error;

use crate::types::{JobRecord, JobStatus};
pub use error::{JobStoreError, StoreResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// Fields accepted by an upsert; everything else is derived or defaulted.
#[derive(Debug, Clone)]
pub struct UpsertInput {
    pub config_name: String,
    pub job_type: String,
    pub workflow_id: String,
    pub priority: i32,
    pub retry_limit: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if absent) the SQLite database at `path` and
    /// applies the WAL-mode pragmas the original agent relied on.
    pub async fn connect(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(JobStoreError::Transient)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(StdDuration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_name TEXT NOT NULL UNIQUE,
                job_type TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL DEFAULT 'pending',
                run_count INTEGER NOT NULL DEFAULT 0,
                retries_attempted INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL DEFAULT 2,
                start_time TEXT,
                end_time TEXT,
                duration REAL,
                error_trace TEXT,
                metadata TEXT,
                worker_id TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON jobs(status, priority)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_start_time ON jobs(start_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<JobRecord> {
        let status_str: String = row.try_get("status")?;
        let status = JobStatus::from_str(&status_str)
            .map_err(|_| JobStoreError::Operational(format!("unknown status '{status_str}'")))?;

        Ok(JobRecord {
            id: row.try_get("id")?,
            config_name: row.try_get("config_name")?,
            job_type: row.try_get("job_type")?,
            workflow_id: row.try_get("workflow_id")?,
            priority: row.try_get("priority")?,
            status,
            run_count: row.try_get("run_count")?,
            retries_attempted: row.try_get("retries_attempted")?,
            retry_limit: row.try_get("retry_limit")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            duration: row.try_get("duration")?,
            error_trace: row.try_get("error_trace")?,
            metadata: row.try_get("metadata")?,
            worker_id: row.try_get("worker_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<JobRecord> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Self::row_to_record(&row)
    }

    pub async fn get_by_config_name(&self, config_name: &str) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE config_name = ?")
            .bind(config_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    /// Idempotent insert-or-update keyed by `config_name`.
    ///
    /// A `done` job only has its priority touched (a re-ingested config
    /// does not restart finished work). A `failed` job is reset to
    /// `pending` with its retry counter cleared, so the new config gets a
    /// fresh attempt budget. Any other status has its descriptive fields
    /// (type/workflow/priority/retry_limit) refreshed in place.
    pub async fn upsert(&self, input: UpsertInput) -> StoreResult<JobRecord> {
        let now = chrono::Utc::now();
        let existing = self.get_by_config_name(&input.config_name).await?;

        match existing {
            Some(job) if job.status == JobStatus::Done => {
                sqlx::query("UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ?")
                    .bind(input.priority)
                    .bind(now)
                    .bind(job.id)
                    .execute(&self.pool)
                    .await?;
                self.get_by_id(job.id).await
            }
            Some(job) if job.status == JobStatus::Failed => {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', retries_attempted = 0, priority = ?, updated_at = ? WHERE id = ?",
                )
                .bind(input.priority)
                .bind(now)
                .bind(job.id)
                .execute(&self.pool)
                .await?;
                self.get_by_id(job.id).await
            }
            Some(job) => {
                sqlx::query(
                    "UPDATE jobs SET job_type = ?, workflow_id = ?, priority = ?, retry_limit = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&input.job_type)
                .bind(&input.workflow_id)
                .bind(input.priority)
                .bind(input.retry_limit)
                .bind(now)
                .bind(job.id)
                .execute(&self.pool)
                .await?;
                self.get_by_id(job.id).await
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO jobs
                        (config_name, job_type, workflow_id, priority, status,
                         run_count, retries_attempted, retry_limit, created_at, updated_at)
                    VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?)
                    "#,
                )
                .bind(&input.config_name)
                .bind(&input.job_type)
                .bind(&input.workflow_id)
                .bind(input.priority)
                .bind(input.retry_limit)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
                self.get_by_id(result.last_insert_rowid()).await
            }
        }
    }

    /// Atomically claims the highest-priority pending job (lowest priority
    /// number first, then lexicographically by `config_name`), marking it
    /// `processing` under an immediate-mode transaction so two concurrent
    /// callers against the same pool can never claim the same row.
    pub async fn lease_next(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let candidate = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY priority ASC, config_name ASC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;

        let Some(candidate_row) = candidate else {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            return Ok(None);
        };
        let id: i64 = candidate_row.try_get("id")?;

        let now = chrono::Utc::now();
        let lease_until = now + chrono::Duration::seconds(lease_seconds);

        sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'processing',
                   worker_id = ?,
                   lease_expires_at = ?,
                   start_time = ?,
                   run_count = run_count + 1,
                   updated_at = ?
             WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(lease_until)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        sqlx::query("COMMIT").execute(&mut *conn).await?;

        self.get_by_id(id).await.map(Some)
    }

    /// Records the outcome of a leased job. On success, marks `done` and
    /// stores the output metadata. On failure, either schedules a retry
    /// (back to `pending`) or marks `failed`, depending on whether the
    /// retry budget is exhausted.
    pub async fn complete(
        &self,
        job_id: i64,
        outcome: JobOutcome,
    ) -> StoreResult<JobRecord> {
        let job = self.get_by_id(job_id).await?;
        let now = chrono::Utc::now();
        let duration = job
            .start_time
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);

        match outcome {
            JobOutcome::Success { metadata } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                       SET status = 'done',
                           end_time = ?,
                           duration = ?,
                           metadata = ?,
                           worker_id = NULL,
                           lease_expires_at = NULL,
                           updated_at = ?
                     WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(duration)
                .bind(metadata)
                .bind(now)
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
            JobOutcome::Failure { error_trace } => {
                let retries_attempted = job.retries_attempted + 1;
                if retries_attempted < job.retry_limit {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                           SET status = 'pending',
                               retries_attempted = ?,
                               error_trace = ?,
                               worker_id = NULL,
                               lease_expires_at = NULL,
                               updated_at = ?
                         WHERE id = ?
                        "#,
                    )
                    .bind(retries_attempted)
                    .bind(error_trace)
                    .bind(now)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
                } else {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                           SET status = 'failed',
                               retries_attempted = ?,
                               end_time = ?,
                               duration = ?,
                               error_trace = ?,
                               worker_id = NULL,
                               lease_expires_at = NULL,
                               updated_at = ?
                         WHERE id = ?
                        "#,
                    )
                    .bind(retries_attempted)
                    .bind(now)
                    .bind(duration)
                    .bind(error_trace)
                    .bind(now)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }

        self.get_by_id(job_id).await
    }

    /// Resets jobs whose lease has expired back to `pending`, comparing
    /// real timestamps rather than the original's lexicographic string
    /// comparison (which breaks across year/DST boundaries for
    /// non-zero-padded values).
    pub async fn recover_orphans(&self, now: chrono::DateTime<chrono::Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'pending',
                   worker_id = NULL,
                   lease_expires_at = NULL,
                   updated_at = ?
             WHERE status = 'processing' AND lease_expires_at < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_by_status(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobRecord>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY priority ASC, config_name ASC")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY priority ASC, config_name ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_record).collect()
    }

    pub async fn set_priority(&self, config_name: &str, priority: i32) -> StoreResult<JobRecord> {
        let clamped = crate::types::Priority::new(priority).get();
        let job = self
            .get_by_config_name(config_name)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(config_name.to_string()))?;

        sqlx::query("UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ?")
            .bind(clamped)
            .bind(chrono::Utc::now())
            .bind(job.id)
            .execute(&self.pool)
            .await?;

        self.get_by_id(job.id).await
    }

    /// Resets a single job to `pending` regardless of its current status
    /// and clears its error/retry bookkeeping. Backs the Control API's
    /// retry and god-mode operations.
    pub async fn reset_to_pending(&self, config_name: &str, reset_retries: bool) -> StoreResult<JobRecord> {
        let job = self
            .get_by_config_name(config_name)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(config_name.to_string()))?;

        if reset_retries {
            sqlx::query(
                "UPDATE jobs SET status = 'pending', retries_attempted = 0, error_trace = NULL, worker_id = NULL, lease_expires_at = NULL, updated_at = ? WHERE id = ?",
            )
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'pending', error_trace = NULL, worker_id = NULL, lease_expires_at = NULL, updated_at = ? WHERE id = ?",
            )
        }
        .bind(chrono::Utc::now())
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        self.get_by_id(job.id).await
    }

    /// Bulk-resets every `failed` job back to `pending`, clearing its
    /// retry/error bookkeeping. Backs `POST /api/jobs/retry-failed`.
    pub async fn retry_all_failed(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'pending',
                   retries_attempted = 0,
                   error_trace = NULL,
                   worker_id = NULL,
                   lease_expires_at = NULL,
                   start_time = NULL,
                   end_time = NULL,
                   duration = NULL,
                   updated_at = ?
             WHERE status = 'failed'
            "#,
        )
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Marks every `pending` job `failed` with a fixed error trace.
    ///
    /// The original agent's equivalent handler wrote a bogus `cancelled`
    /// status to the wrong table (see DESIGN.md). This crate has only one
    /// terminal "won't run" state, so cancellation is represented as a
    /// `failed` job whose `error_trace` names the cause, which every
    /// existing status filter already understands.
    pub async fn cancel_all_pending(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'failed',
                   error_trace = 'Cancelled by operator',
                   end_time = ?,
                   updated_at = ?
             WHERE status = 'pending'
            "#,
        )
        .bind(chrono::Utc::now())
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_retry(&self, ids: &[i64]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE jobs SET status = 'pending', retries_attempted = 0, error_trace = NULL, worker_id = NULL, lease_expires_at = NULL, updated_at = ? WHERE status = 'failed' AND id IN ({placeholders})",
        );
        let mut query = sqlx::query(&sql).bind(chrono::Utc::now());
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_delete(&self, ids: &[i64]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM jobs WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> StoreResult<JobStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut by_status = std::collections::HashMap::new();
        let mut total = 0i64;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            total += count;
            by_status.insert(status, count);
        }
        let avg_duration: Option<f64> =
            sqlx::query("SELECT AVG(duration) as avg_duration FROM jobs WHERE status = 'done' AND duration IS NOT NULL")
                .fetch_one(&self.pool)
                .await?
                .try_get("avg_duration")?;

        Ok(JobStats {
            total,
            by_status,
            avg_duration_seconds: avg_duration,
        })
    }

    /// Runs an operator-supplied SQL statement and returns its result
    /// shape generically (Design Notes §9: no typed column assumptions).
    /// An explicit escape hatch — access is gated by the Control API's
    /// caller, not by this method.
    pub async fn execute_sql(&self, sql: &str) -> StoreResult<SqlResult> {
        let trimmed = sql.trim_start().to_lowercase();
        if trimmed.starts_with("select") || trimmed.starts_with("pragma") {
            let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
            let columns = rows
                .first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let values = rows
                .iter()
                .map(|row| {
                    (0..row.len())
                        .map(|i| {
                            row.try_get::<Option<String>, _>(i)
                                .unwrap_or(None)
                                .map(serde_json::Value::String)
                                .unwrap_or(serde_json::Value::Null)
                        })
                        .collect()
                })
                .collect();
            Ok(SqlResult::Rows { columns, rows: values })
        } else {
            let result = sqlx::query(sql).execute(&self.pool).await?;
            Ok(SqlResult::Affected(result.rows_affected()))
        }
    }
}

use sqlx::Column;

#[derive(Debug)]
pub enum JobOutcome {
    Success { metadata: Option<String> },
    Failure { error_trace: String },
}

#[derive(Debug, serde::Serialize)]
pub struct JobStats {
    pub total: i64,
    pub by_status: std::collections::HashMap<String, i64>,
    pub avg_duration_seconds: Option<f64>,
}

#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
pub enum SqlResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Affected(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;

    fn input(name: &str) -> UpsertInput {
        UpsertInput {
            config_name: name.to_string(),
            job_type: "T2I".to_string(),
            workflow_id: "wf_portrait".to_string(),
            priority: 50,
            retry_limit: 2,
        }
    }

    #[tokio::test]
    async fn upsert_then_lease_then_complete() {
        let store = SqliteStore::connect_memory().await.unwrap();
        let job = store.upsert(input("T2I_1_1_a.yaml")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let leased = store.lease_next("worker-1", 300).await.unwrap().unwrap();
        assert_eq!(leased.status, JobStatus::Processing);
        assert_eq!(leased.worker_id.as_deref(), Some("worker-1"));

        let done = store
            .complete(leased.id, JobOutcome::Success { metadata: Some("{}".to_string()) })
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert!(done.worker_id.is_none());
    }

    #[tokio::test]
    async fn lease_next_returns_none_when_empty() {
        let store = SqliteStore::connect_memory().await.unwrap();
        assert!(store.lease_next("worker-1", 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_retries_until_limit_then_fails() {
        let store = SqliteStore::connect_memory().await.unwrap();
        let mut input = input("T2I_1_1_b.yaml");
        input.retry_limit = 2;
        store.upsert(input).await.unwrap();

        let leased = store.lease_next("w1", 300).await.unwrap().unwrap();
        let retried = store
            .complete(leased.id, JobOutcome::Failure { error_trace: "boom".to_string() })
            .await
            .unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retries_attempted, 1);

        let leased_again = store.lease_next("w1", 300).await.unwrap().unwrap();
        let failed = store
            .complete(leased_again.id, JobOutcome::Failure { error_trace: "boom again".to_string() })
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retries_attempted, 2);
    }

    #[tokio::test]
    async fn upsert_on_done_job_only_touches_priority() {
        let store = SqliteStore::connect_memory().await.unwrap();
        store.upsert(input("T2I_1_1_c.yaml")).await.unwrap();
        let leased = store.lease_next("w1", 300).await.unwrap().unwrap();
        store
            .complete(leased.id, JobOutcome::Success { metadata: None })
            .await
            .unwrap();

        let mut reupsert = input("T2I_1_1_c.yaml");
        reupsert.priority = 10;
        let job = store.upsert(reupsert).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.priority, 10);
    }

    #[tokio::test]
    async fn recover_orphans_resets_expired_leases() {
        let store = SqliteStore::connect_memory().await.unwrap();
        store.upsert(input("T2I_1_1_d.yaml")).await.unwrap();
        store.lease_next("w1", -10).await.unwrap();

        let recovered = store.recover_orphans(chrono::Utc::now()).await.unwrap();
        assert_eq!(recovered, 1);
        let job = store.get_by_config_name("T2I_1_1_d.yaml").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn set_priority_clamps_range() {
        let store = SqliteStore::connect_memory().await.unwrap();
        store.upsert(input("T2I_1_1_e.yaml")).await.unwrap();
        let job = store.set_priority("T2I_1_1_e.yaml", 5000).await.unwrap();
        assert_eq!(job.priority, 999);
    }
}
