//! Monitoring loops (§4.7): queue-depth/failure-rate every minute,
//! scraping-job progress/stale-heartbeat every 2 minutes, stale-lease
//! reaping every 3 minutes, resource usage every 5 minutes. Grounded on the
//! reference service's `scheduled_tasks::start_scheduler` cron-job shape,
//! specialized to fixed-interval `tokio::time::interval` loops since these
//! checks run far more often than a cron expression comfortably expresses.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domains::jobs::JobQueueStore;
use crate::domains::scraper::ScrapingJobRepository;
use crate::kernel::RateLimitedClient;

use super::effects::MonitoringRepository;
use super::models::{AlertSeverity, AlertType};

const QUEUE_DEPTH_THRESHOLD: i64 = 10_000;
const FAILURE_RATE_THRESHOLD: f64 = 0.10;
const STALE_HEARTBEAT: chrono::Duration = chrono::Duration::minutes(5);
const RATE_LIMIT_USAGE_THRESHOLD: f64 = 0.90;

pub struct Monitor {
    repo: MonitoringRepository,
    queue: Arc<JobQueueStore>,
    scraping_jobs: Arc<ScrapingJobRepository>,
    http: Arc<RateLimitedClient>,
    visibility_timeout: Duration,
}

impl Monitor {
    pub fn new(
        repo: MonitoringRepository,
        queue: Arc<JobQueueStore>,
        scraping_jobs: Arc<ScrapingJobRepository>,
        http: Arc<RateLimitedClient>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            queue,
            scraping_jobs,
            http,
            visibility_timeout,
        }
    }

    /// Spawns the four cadence loops; returns once `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let loops: Vec<_> = vec![
            tokio::spawn(self.clone().loop_every(Duration::from_secs(60), cancel.clone(), Self::check_queue_health)),
            tokio::spawn(self.clone().loop_every(Duration::from_secs(120), cancel.clone(), Self::check_scraping_jobs)),
            tokio::spawn(self.clone().loop_every(Duration::from_secs(180), cancel.clone(), Self::reap_stale_leases)),
            tokio::spawn(self.clone().loop_every(Duration::from_secs(300), cancel.clone(), Self::check_resources)),
        ];
        for handle in loops {
            let _ = handle.await;
        }
    }

    async fn loop_every<F, Fut>(self: Arc<Self>, period: Duration, cancel: CancellationToken, check: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => check(self.clone()).await,
            }
        }
    }

    async fn check_queue_health(self: Arc<Self>) {
        match self.queue.pending_count(None).await {
            Ok(depth) => {
                if let Err(e) = self.repo.record_metric("queue_depth", depth as f64, serde_json::json!({})).await {
                    error!(error = %e, "failed to record queue_depth metric");
                }
                if depth > QUEUE_DEPTH_THRESHOLD {
                    let _ = self
                        .repo
                        .raise_alert(
                            AlertType::Warning,
                            AlertSeverity::High,
                            "queue depth exceeds threshold",
                            serde_json::json!({"depth": depth, "threshold": QUEUE_DEPTH_THRESHOLD}),
                        )
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to read pending count"),
        }

        match self.queue.failure_rate_last_hour().await {
            Ok(rate) => {
                if let Err(e) = self.repo.record_metric("failure_rate_1h", rate, serde_json::json!({})).await {
                    error!(error = %e, "failed to record failure_rate_1h metric");
                }
                if rate > FAILURE_RATE_THRESHOLD {
                    let _ = self
                        .repo
                        .raise_alert(
                            AlertType::Error,
                            AlertSeverity::Critical,
                            "job failure rate exceeds threshold over the last hour",
                            serde_json::json!({"rate": rate, "threshold": FAILURE_RATE_THRESHOLD}),
                        )
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to compute failure rate"),
        }
    }

    async fn check_scraping_jobs(self: Arc<Self>) {
        match self.scraping_jobs.stale(STALE_HEARTBEAT).await {
            Ok(stale_jobs) => {
                for job in stale_jobs {
                    info!(scraping_job_id = %job.id, "stale heartbeat detected, marking failed");
                    if let Err(e) = self
                        .scraping_jobs
                        .mark_failed(job.id, "heartbeat stale for longer than 5 minutes")
                        .await
                    {
                        error!(scraping_job_id = %job.id, error = %e, "failed to mark scraping job failed");
                        continue;
                    }
                    let _ = self
                        .repo
                        .raise_alert(
                            AlertType::Warning,
                            AlertSeverity::High,
                            "scraping job heartbeat went stale",
                            serde_json::json!({"scraping_job_id": job.id, "registry": format!("{:?}", job.registry)}),
                        )
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to query stale scraping jobs"),
        }
    }

    async fn reap_stale_leases(self: Arc<Self>) {
        match self.queue.release_stale(self.visibility_timeout).await {
            Ok(released) if released > 0 => {
                let _ = self
                    .repo
                    .raise_alert(
                        AlertType::Warning,
                        AlertSeverity::High,
                        "stale job leases released back to pending",
                        serde_json::json!({"count": released}),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to release stale leases"),
        }
    }

    async fn check_resources(self: Arc<Self>) {
        if let Ok(size) = self.repo.database_size_bytes().await {
            let _ = self.repo.record_metric("database_size_bytes", size as f64, serde_json::json!({})).await;
        }
        if let Ok(tables) = self.repo.largest_table_sizes(10).await {
            for (name, size) in tables {
                let _ = self
                    .repo
                    .record_metric("table_size_bytes", size as f64, serde_json::json!({"table": name}))
                    .await;
            }
        }

        for key in self.http.limiter().tracked_keys() {
            let usage = self.http.limiter().usage_fraction(&key);
            let _ = self
                .repo
                .record_metric("rate_limit_usage", usage, serde_json::json!({"key": key}))
                .await;
            if usage > RATE_LIMIT_USAGE_THRESHOLD {
                let _ = self
                    .repo
                    .raise_alert(
                        AlertType::Warning,
                        AlertSeverity::Medium,
                        "registry rate-limit budget nearly exhausted",
                        serde_json::json!({"key": key, "usage": usage}),
                    )
                    .await;
            }
        }
    }
}
