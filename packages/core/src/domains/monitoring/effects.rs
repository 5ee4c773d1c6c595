use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Alert, AlertSeverity, AlertType, Metric};

#[derive(Clone)]
pub struct MonitoringRepository {
    pool: PgPool,
}

impl MonitoringRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record_metric(&self, name: &str, value: f64, tags: serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_metrics (id, name, value, tags, recorded_at) VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(value)
        .bind(tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO system_alerts (id, alert_type, severity, message, context, created_at)
               VALUES ($1, $2, $3, $4, $5, NOW())"#,
        )
        .bind(Uuid::new_v4())
        .bind(alert_type)
        .bind(severity)
        .bind(message)
        .bind(context)
        .execute(&self.pool)
        .await?;
        tracing::warn!(alert_type = ?alert_type, severity = ?severity, message, "alert raised");
        Ok(())
    }

    pub async fn recent_metrics(&self, name: &str, limit: i64) -> Result<Vec<Metric>> {
        let rows = sqlx::query_as::<_, Metric>(
            "SELECT id, name, value, tags, recorded_at FROM system_metrics WHERE name = $1 ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, Alert>(
            "SELECT id, alert_type, severity, message, context, created_at FROM system_alerts ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Postgres database size in bytes, for the every-5-minutes resource
    /// check (§4.7).
    pub async fn database_size_bytes(&self) -> Result<i64> {
        let (size,): (i64,) = sqlx::query_as("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await?;
        Ok(size)
    }

    /// Byte size of the largest tables, for the same check.
    pub async fn largest_table_sizes(&self, limit: i64) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT relname, pg_total_relation_size(relid) AS size
            FROM pg_catalog.pg_statio_user_tables
            ORDER BY size DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
