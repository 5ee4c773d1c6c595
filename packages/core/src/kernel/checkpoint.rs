//! Checkpoint store: append-only per-`ScrapingJob` checkpoints, latest wins
//! on resume (§3, §4.6). Grounded on the `Record` trait's insert/read shape
//! from the reference job model, specialized to an append-only table rather
//! than a single mutable row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// One persisted checkpoint row. `data` carries the adapter's opaque
/// `Cursor` (serialized) plus whatever delta the scraper engine wants to
/// replay on resume.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scraping_job_id: Uuid,
    pub checkpoint_type: String,
    pub data: serde_json::Value,
    pub items_processed: i64,
    pub created_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    pool: PgPool,
}

impl CheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a new checkpoint. Never overwrites a prior row; `latest()`
    /// always resolves by `created_at DESC`.
    pub async fn persist(
        &self,
        scraping_job_id: Uuid,
        checkpoint_type: &str,
        data: serde_json::Value,
        items_processed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraping_checkpoints (scraping_job_id, checkpoint_type, data, items_processed, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(scraping_job_id)
        .bind(checkpoint_type)
        .bind(data)
        .bind(items_processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest checkpoint for a scraping job, used to resume after a crash.
    /// Returns `None` for a job that has never checkpointed, meaning the
    /// scraper engine starts from the adapter's initial cursor (§4.6 step 1).
    pub async fn latest(&self, scraping_job_id: Uuid) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, Checkpoint>(
            r#"
            SELECT scraping_job_id, checkpoint_type, data, items_processed, created_at
            FROM scraping_checkpoints
            WHERE scraping_job_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scraping_job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
