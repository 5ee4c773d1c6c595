//! Durable job queue (§4.2): `job_queue` table, FIFO-with-priority lanes,
//! lease-based at-least-once delivery. The claim query's `WITH ... FOR
//! UPDATE SKIP LOCKED` shape is carried directly from the reference
//! service's `Job::claim_jobs`, narrowed from "claim up to N jobs" to the
//! single-job `lease` the binding contract specifies.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::kernel::rate_limiter::bounded_backoff;

use super::job::Job;

const RETRY_BASE: std::time::Duration = std::time::Duration::from_secs(60);
const RETRY_CAP: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Postgres-backed job queue. One instance is shared by every worker; the
/// row-level lease acquired by `lease()` is the only thing that makes
/// concurrent workers safe (§5 "the job queue is the only cross-worker
/// shared resource").
pub struct JobQueueStore {
    pool: PgPool,
}

impl JobQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// §4.2 `enqueue`.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        priority: i16,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Uuid, JobQueueError> {
        let job = Job::builder()
            .queue(queue)
            .job_type(job_type)
            .payload(payload)
            .priority(priority)
            .scheduled_for(scheduled_for.unwrap_or_else(Utc::now))
            .build();

        sqlx::query(
            r#"
            INSERT INTO job_queue (
                id, queue, job_type, payload, priority, status, attempts, max_attempts,
                scheduled_for, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        info!(job_id = %job.id, queue, job_type, priority, "enqueued job");
        Ok(job.id)
    }

    /// §4.2 `lease`: atomically picks the highest-priority ready job across
    /// `queues` whose `scheduled_for <= now` and whose status is pending OR
    /// (processing AND the lease has expired), in `(priority DESC,
    /// scheduled_for ASC)` order. No cross-queue ordering guarantee beyond
    /// that (§5 ordering (a)).
    #[instrument(skip(self, queues))]
    pub async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        visibility: std::time::Duration,
    ) -> Result<Option<Job>, JobQueueError> {
        let visibility_secs = visibility.as_secs() as f64;
        let row = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
                SELECT id
                FROM job_queue
                WHERE queue = ANY($1)
                  AND scheduled_for <= NOW()
                  AND (
                        status = 'pending'
                        OR (status = 'processing' AND locked_at + ($2 || ' seconds')::INTERVAL < NOW())
                      )
                ORDER BY priority DESC, scheduled_for ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue
            SET status = 'processing',
                locked_by = $3,
                locked_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING id, queue, job_type, payload, priority, status, attempts, max_attempts,
                      scheduled_for, locked_at, locked_by, last_error, result, completed_at,
                      created_at, updated_at
            "#,
        )
        .bind(queues)
        .bind(visibility_secs.to_string())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &row {
            info!(job_id = %job.id, worker_id, attempts = job.attempts, "leased job");
        }
        Ok(row)
    }

    /// §4.2 `complete`.
    #[instrument(skip(self, result))]
    pub async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> Result<(), JobQueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'completed', result = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        if rows.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(job_id));
        }
        info!(job_id = %job_id, "completed job");
        Ok(())
    }

    /// §4.2 `fail`: re-schedules at `now + min(60s * 2^attempts, 1h)` while
    /// attempts remain, else moves the job to `failed` terminally.
    #[instrument(skip(self))]
    pub async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), JobQueueError> {
        let row: Option<(i32, i32)> =
            sqlx::query_as("SELECT attempts, max_attempts FROM job_queue WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((attempts, max_attempts)) = row else {
            return Err(JobQueueError::NotFound(job_id));
        };

        if attempts < max_attempts {
            let delay = bounded_backoff(attempts, RETRY_BASE, RETRY_CAP);
            let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'pending', last_error = $2, scheduled_for = $3,
                    locked_by = NULL, locked_at = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .bind(retry_at)
            .execute(&self.pool)
            .await?;
            warn!(job_id = %job_id, attempts, retry_at = %retry_at, "job failed, scheduled retry");
        } else {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failed', last_error = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            warn!(job_id = %job_id, attempts, "job exhausted retries, marked failed");
        }
        Ok(())
    }

    /// Extends a held lease's `locked_at` to "now", keeping a long-running
    /// handler's job invisible to other workers past the original
    /// visibility window (§4.3's 30s worker heartbeat). A no-op if the
    /// lease was already reaped out from under the worker.
    pub async fn extend_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), JobQueueError> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET locked_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// §4.2 `release_stale`, run by the orchestrator every 3 minutes:
    /// returns any job whose lease has expired to pending. Returns the
    /// count released so monitoring can report it.
    #[instrument(skip(self))]
    pub async fn release_stale(&self, visibility: std::time::Duration) -> Result<u64, JobQueueError> {
        let visibility_secs = visibility.as_secs() as f64;
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE status = 'processing'
              AND locked_at + ($1 || ' seconds')::INTERVAL < NOW()
            "#,
        )
        .bind(visibility_secs.to_string())
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            warn!(released, "released stale job leases back to pending");
        }
        Ok(released)
    }

    /// Pending-job count per queue, used by the orchestrator's auto-scale
    /// loop (§4.4) and the monitoring queue-depth metric (§4.7).
    pub async fn pending_count(&self, queue: Option<&str>) -> Result<i64, JobQueueError> {
        let count: (i64,) = match queue {
            Some(q) => {
                sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE status = 'pending' AND queue = $1")
                    .bind(q)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.0)
    }

    /// Fraction of jobs that ended in `failed` over the last hour, for the
    /// monitoring failure-rate alert (§4.7).
    pub async fn failure_rate_last_hour(&self) -> Result<f64, JobQueueError> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM job_queue
            WHERE updated_at >= NOW() - INTERVAL '1 hour'
              AND status IN ('failed', 'completed')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        if row.1 == 0 {
            Ok(0.0)
        } else {
            Ok(row.0 as f64 / row.1 as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_formula_matches_spec_bound() {
        let d0 = bounded_backoff(0, RETRY_BASE, RETRY_CAP);
        assert_eq!(d0, std::time::Duration::from_secs(60));
        let d_large = bounded_backoff(10, RETRY_BASE, RETRY_CAP);
        assert_eq!(d_large, RETRY_CAP);
    }
}
