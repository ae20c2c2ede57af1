//! Durable job store.
//!
//! Single source of truth for job existence and state. Every
//! status-changing operation is gated by the transition table and performed
//! as a conditional UPDATE on the current partition, so concurrent movers of
//! the same job id cannot both succeed.

use async_trait::async_trait;
use chrono::Utc;

use crate::database::DbPool;
use crate::database::models::{
    FailureInfo, JobCounts, JobRecord, JobStatus, NewJob, SummaryResult, ensure_transition,
};
use crate::{Error, Result};

/// Durable job store trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new queued job. Fails with `DuplicateJob` if the id exists
    /// in any partition.
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord>;

    /// Move a queued job to processing, setting `started_at` and resetting
    /// progress. Fails with `NotInQueue` / `AlreadyProcessing`.
    async fn claim(&self, id: &str) -> Result<JobRecord>;

    /// In-place rewrite of a processing job's progress.
    async fn update_progress(&self, id: &str, percent: u8, step: &str) -> Result<()>;

    /// Persist the attempt counter of a processing job. The counter never
    /// decreases.
    async fn record_attempt(&self, id: &str, attempt: u32) -> Result<()>;

    /// Move a processing job to completed with its result payload.
    async fn complete(&self, id: &str, result: &SummaryResult) -> Result<()>;

    /// Move a processing job to failed with its failure payload. Preserves
    /// the original `queued_at`.
    async fn fail(&self, id: &str, failure: &FailureInfo) -> Result<()>;

    /// Write a fresh queued record from a failed or processing job.
    ///
    /// From failed this is a user-triggered re-submission: the attempt
    /// counter resets to 1 and the failure payload is cleared. From
    /// processing this is the recovery path for a stalled job, validated as
    /// the explicit PROCESSING -> STALLED -> QUEUED two-hop; the attempt
    /// counter is preserved.
    async fn requeue(&self, id: &str) -> Result<()>;

    /// Move a completed job to archived.
    async fn archive(&self, id: &str) -> Result<()>;

    /// Remove an archived or failed job record.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Queued jobs, oldest first (ties broken by id).
    async fn list_queued(&self) -> Result<Vec<JobRecord>>;

    /// Processing jobs, oldest `started_at` first.
    async fn list_processing(&self) -> Result<Vec<JobRecord>>;

    /// Read-only lookup across all partitions.
    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Per-status job counts.
    async fn counts(&self) -> Result<JobCounts>;

    /// Delete completed/failed jobs older than the retention period.
    /// Returns the number of rows removed.
    async fn purge_terminal(&self, retention_days: u32) -> Result<u64>;
}

/// Check the externally supplied job id shape.
fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a submission before insertion.
fn validate_new_job(job: &NewJob) -> Result<()> {
    if !is_valid_job_id(&job.id) {
        return Err(Error::validation(format!(
            "invalid job id: {:?} (expected [A-Za-z0-9_-]+)",
            job.id
        )));
    }

    let parsed = url::Url::parse(&job.source_url)
        .map_err(|e| Error::validation(format!("invalid source url: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(Error::validation("source url must use https"));
    }

    if let Some(target) = &job.notify_target
        && !target.contains('@')
    {
        return Err(Error::validation("notify target must be an email address"));
    }

    Ok(())
}

/// SQLx implementation of the job store over SQLite.
pub struct SqlxJobStore {
    pool: DbPool,
}

impl SqlxJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRecord>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Current status of a row, failing on unknown values.
    fn status_of(record: &JobRecord) -> Result<JobStatus> {
        record.job_status().ok_or_else(|| {
            Error::Other(format!(
                "corrupt status {:?} for job {}",
                record.status, record.id
            ))
        })
    }
}

#[async_trait]
impl JobStore for SqlxJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord> {
        validate_new_job(&job)?;

        let now = Utc::now().to_rfc3339();
        let insert = sqlx::query(
            r#"
            INSERT INTO job (id, source_url, status, notify_target, queued_at, updated_at,
                             progress_percent, attempt_count)
            VALUES (?, ?, ?, ?, ?, ?, 0, 1)
            "#,
        )
        .bind(&job.id)
        .bind(&job.source_url)
        .bind(JobStatus::Queued.as_str())
        .bind(&job.notify_target)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(Error::duplicate_job(&job.id));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(job_id = %job.id, url = %job.source_url, "Job enqueued");

        self.fetch(&job.id)
            .await?
            .ok_or_else(|| Error::not_found("Job", &job.id))
    }

    async fn claim(&self, id: &str) -> Result<JobRecord> {
        let current = self
            .fetch(id)
            .await?
            .ok_or_else(|| Error::not_in_queue(id))?;

        match Self::status_of(&current)? {
            JobStatus::Queued => {}
            JobStatus::Processing => return Err(Error::already_processing(id)),
            _ => return Err(Error::not_in_queue(id)),
        }
        ensure_transition(JobStatus::Queued, JobStatus::Processing)?;

        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = ?, started_at = ?, updated_at = ?,
                progress_percent = 0, current_step = NULL
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Processing.as_str())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(JobStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Lost the race to a concurrent claimer.
            return Err(Error::already_processing(id));
        }

        self.fetch(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn update_progress(&self, id: &str, percent: u8, step: &str) -> Result<()> {
        if percent > 100 {
            return Err(Error::validation(format!(
                "progress must be 0-100, got {percent}"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET progress_percent = ?, current_step = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(percent as i64)
        .bind(step)
        .bind(&now)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Processing job", id));
        }
        Ok(())
    }

    async fn record_attempt(&self, id: &str, attempt: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        // MAX keeps the counter monotonic under concurrent writers.
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET attempt_count = MAX(attempt_count, ?), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(attempt as i64)
        .bind(&now)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Processing job", id));
        }
        Ok(())
    }

    async fn complete(&self, id: &str, result: &SummaryResult) -> Result<()> {
        let current = self
            .fetch(id)
            .await?
            .ok_or_else(|| Error::not_found("Processing job", id))?;
        ensure_transition(Self::status_of(&current)?, JobStatus::Completed)?;

        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(result)?;
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = ?, completed_at = ?, updated_at = ?,
                progress_percent = 100, result = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(&now)
        .bind(&now)
        .bind(&payload)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Processing job", id));
        }

        tracing::info!(job_id = %id, "Job completed");
        Ok(())
    }

    async fn fail(&self, id: &str, failure: &FailureInfo) -> Result<()> {
        let current = self
            .fetch(id)
            .await?
            .ok_or_else(|| Error::not_found("Processing job", id))?;
        ensure_transition(Self::status_of(&current)?, JobStatus::Failed)?;

        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(failure)?;
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = ?, failed_at = ?, updated_at = ?, failure = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(&now)
        .bind(&now)
        .bind(&payload)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Processing job", id));
        }

        tracing::warn!(job_id = %id, code = %failure.code, "Job failed");
        Ok(())
    }

    async fn requeue(&self, id: &str) -> Result<()> {
        let current = self.fetch(id).await?.ok_or_else(|| Error::not_found("Job", id))?;
        let status = Self::status_of(&current)?;
        let now = Utc::now().to_rfc3339();

        let updated = match status {
            JobStatus::Failed => {
                ensure_transition(JobStatus::Failed, JobStatus::Queued)?;
                sqlx::query(
                    r#"
                    UPDATE job
                    SET status = ?, queued_at = ?, updated_at = ?,
                        attempt_count = 1, progress_percent = 0, current_step = NULL,
                        started_at = NULL, failed_at = NULL, failure = NULL
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(JobStatus::Queued.as_str())
                .bind(&now)
                .bind(&now)
                .bind(id)
                .bind(JobStatus::Failed.as_str())
                .execute(&self.pool)
                .await?
            }
            JobStatus::Processing => {
                // Stalled reclaim: the intermediate state is validated, not stored.
                ensure_transition(JobStatus::Processing, JobStatus::Stalled)?;
                ensure_transition(JobStatus::Stalled, JobStatus::Queued)?;
                sqlx::query(
                    r#"
                    UPDATE job
                    SET status = ?, queued_at = ?, updated_at = ?,
                        progress_percent = 0, current_step = NULL, started_at = NULL
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(JobStatus::Queued.as_str())
                .bind(&now)
                .bind(&now)
                .bind(id)
                .bind(JobStatus::Processing.as_str())
                .execute(&self.pool)
                .await?
            }
            other => {
                return Err(Error::InvalidTransition {
                    from: other.as_str().to_string(),
                    to: JobStatus::Queued.as_str().to_string(),
                });
            }
        };

        if updated.rows_affected() == 0 {
            // The job moved out from under us; the caller decides whether
            // that is tolerable (recovery sweeps treat it as a no-op).
            return Err(Error::not_found("Job", id));
        }

        tracing::info!(job_id = %id, from = %status, "Job requeued");
        Ok(())
    }

    async fn archive(&self, id: &str) -> Result<()> {
        let current = self.fetch(id).await?.ok_or_else(|| Error::not_found("Job", id))?;
        let status = Self::status_of(&current)?;
        ensure_transition(status, JobStatus::Archived)?;

        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query("UPDATE job SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(JobStatus::Archived.as_str())
            .bind(&now)
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let current = self.fetch(id).await?.ok_or_else(|| Error::not_found("Job", id))?;
        let status = Self::status_of(&current)?;
        ensure_transition(status, JobStatus::Deleted)?;

        let deleted = sqlx::query("DELETE FROM job WHERE id = ? AND status = ?")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }

        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    async fn list_queued(&self) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM job WHERE status = ? ORDER BY queued_at ASC, id ASC",
        )
        .bind(JobStatus::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_processing(&self) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM job WHERE status = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(JobStatus::Processing.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        self.fetch(id).await
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued = count,
                Some(JobStatus::Processing) => counts.processing = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                Some(JobStatus::Archived) => counts.archived = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Ok(0);
        }

        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        let deleted = sqlx::query(
            "DELETE FROM job WHERE status IN (?, ?) AND updated_at < ?",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let removed = deleted.rows_affected();
        if removed > 0 {
            tracing::info!(count = removed, "Purged old terminal jobs");
        }
        Ok(removed)
    }
}
