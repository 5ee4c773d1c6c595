//! `system_metrics`/`system_alerts`: append-only observability tables
//! (§4.7, §6). Grounded on the reference service's `AgentRunStat::create_batch`
//! append-only stat rows, generalized from per-agent-run stats to
//! process-wide metrics and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_type", rename_all = "snake_case")]
pub enum AlertType {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_severity", rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Metric {
    pub id: Uuid,
    pub name: String,
    pub value: f64,
    pub tags: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
