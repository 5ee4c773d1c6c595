//! Job model (§3, §4.2). Field names follow the binding data-model contract
//! verbatim; the builder/`Record`-style CRUD shape is grounded on the
//! reference service's job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, FromRow, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub queue: String,
    pub job_type: String,
    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,

    #[builder(default = 0)]
    pub priority: i16,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 5)]
    pub max_attempts: i32,

    #[builder(default = Utc::now())]
    pub scheduled_for: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,

    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn immediate(queue: impl Into<String>, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::builder()
            .queue(queue.into())
            .job_type(job_type.into())
            .payload(payload)
            .build()
    }

    pub fn scheduled(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        priority: i16,
    ) -> Self {
        Self::builder()
            .queue(queue.into())
            .job_type(job_type.into())
            .payload(payload)
            .scheduled_for(scheduled_for)
            .priority(priority)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_job_defaults_to_pending_and_zero_attempts() {
        let job = Job::immediate("scrape", "scrape_full", serde_json::json!({"registry": "ctgov"}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 5);
    }
}
