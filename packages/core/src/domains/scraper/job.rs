//! `ScrapingJob`: the long-running context for one adapter run (§3, §6).
//! Distinct from the durable `job_queue` row that triggers it — a single
//! `scrape_full`/`scrape_incremental` queue job owns exactly one
//! `ScrapingJob` for its lifetime, the way the reference service keeps a
//! `Job` row separate from the domain-level work it describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use registries::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scraping_job_status", rename_all = "snake_case")]
pub enum ScrapingJobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scraping_job_type", rename_all = "snake_case")]
pub enum ScrapingJobType {
    Full,
    Incremental,
    Condition,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScrapingJobRow {
    pub id: Uuid,
    pub registry: Registry,
    pub job_type: ScrapingJobType,
    pub status: ScrapingJobStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub processed_items: i64,
    pub failed_items: i64,
    pub total_items: Option<i64>,
    pub progress: serde_json::Value,
    pub checkpoint_data: serde_json::Value,
    pub error_log: serde_json::Value,
    pub worker_id: Option<String>,
}

pub struct ScrapingJobRepository {
    pool: PgPool,
}

impl ScrapingJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn create(
        &self,
        registry: Registry,
        job_type: ScrapingJobType,
        worker_id: &str,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scraping_jobs (
                id, registry, job_type, status, started_at, last_heartbeat,
                processed_items, failed_items, total_items, progress, checkpoint_data,
                error_log, worker_id
            ) VALUES ($1, $2, $3, 'running', NOW(), NOW(), 0, 0, NULL, '{}', '{}', '[]', $4)
            "#,
        )
        .bind(id)
        .bind(registry)
        .bind(job_type)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn find(&self, id: Uuid) -> anyhow::Result<Option<ScrapingJobRow>> {
        let row = sqlx::query_as::<_, ScrapingJobRow>(
            r#"SELECT id, registry, job_type, status, started_at, last_heartbeat,
                      processed_items, failed_items, total_items, progress, checkpoint_data,
                      error_log, worker_id
               FROM scraping_jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Worker heartbeat (§4.3 "heartbeats its active ScrapingJob every 30s"),
    /// also updating the running counters the scraper engine tracks.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        processed_items: i64,
        failed_items: i64,
        progress: serde_json::Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE scraping_jobs
            SET last_heartbeat = NOW(), processed_items = $2, failed_items = $3, progress = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed_items)
        .bind(failed_items)
        .bind(progress)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_error(&self, id: Uuid, entry: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE scraping_jobs SET error_log = error_log || to_jsonb($2::text) WHERE id = $1"#,
        )
        .bind(id)
        .bind(entry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid, total_items: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE scraping_jobs SET status = 'completed', total_items = $2, last_heartbeat = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(total_items)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE scraping_jobs SET status = 'failed', last_heartbeat = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.append_error(id, reason).await
    }

    /// `ScrapingJob`s whose heartbeat is older than `max_age` and still
    /// `running` — the monitoring subsystem's stale-heartbeat detection
    /// (§4.7).
    pub async fn stale(&self, max_age: chrono::Duration) -> anyhow::Result<Vec<ScrapingJobRow>> {
        let rows = sqlx::query_as::<_, ScrapingJobRow>(
            r#"
            SELECT id, registry, job_type, status, started_at, last_heartbeat,
                   processed_items, failed_items, total_items, progress, checkpoint_data,
                   error_log, worker_id
            FROM scraping_jobs
            WHERE status = 'running' AND last_heartbeat < NOW() - ($1 || ' seconds')::INTERVAL
            "#,
        )
        .bind(max_age.num_seconds().to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn persist_checkpoint_cursor(&self, id: Uuid, checkpoint_data: serde_json::Value) -> anyhow::Result<()> {
        sqlx::query("UPDATE scraping_jobs SET checkpoint_data = $2 WHERE id = $1")
            .bind(id)
            .bind(checkpoint_data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
