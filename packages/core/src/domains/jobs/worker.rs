//! Worker pool (§4.3): polls queues, leases jobs, dispatches to handlers,
//! heartbeats. Grounded on the reference service's `JobWorker` poll loop
//! and `JobWorkerConfig`, adapted from seesaw command dispatch to the
//! simpler `JobHandler` trait this system's four handler kinds need
//! (scraper, dedup, enrich, geocode).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::job::Job;
use super::queue::JobQueueStore;

const POLL_SLEEP: Duration = Duration::from_secs(1);
const LEASE_EXTENSION_INTERVAL: Duration = Duration::from_secs(30);

/// A job handler's outcome, distinguishing a cooperative cancellation
/// (§4.3 "Cancellation") from every other failure so the worker can record
/// the right `last_error` without the handler needing to know about the
/// job queue's retry policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

/// Implemented once per job type (`scrape_full`, `scrape_incremental`,
/// `deduplicate`, `enrich`, `geocode`, ...). Handlers receive the raw `Job`
/// (not a deserialized command) and a cancellation token they must check
/// periodically for long-running work, mirroring §4.3's 60s-to-checkpoint
/// requirement.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<serde_json::Value, HandlerError>;
}

/// Maps `job_type` strings to handlers, replacing the reference service's
/// `CommandRegistry` (unneeded here since payloads are inspected inline by
/// each handler rather than deserialized into distinct command structs).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

pub struct WorkerConfig {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub visibility_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(queues: Vec<String>, visibility_timeout: Duration) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            queues,
            visibility_timeout,
        }
    }
}

/// A single worker: `lease -> dispatch -> complete|fail`, looping until
/// cancelled. Each worker processes one job at a time serially; a handler
/// may itself fan out internally with bounded parallelism (§4.3).
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<JobQueueStore>,
    handlers: HandlerRegistry,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<JobQueueStore>, handlers: HandlerRegistry) -> Self {
        Self { config, queue, handlers }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Runs until `shutdown` is cancelled. On shutdown: stop leasing new
    /// jobs; any job already leased is allowed to finish naturally (its
    /// lease will simply expire and be reaped if the process dies first,
    /// satisfying "release any held leases back to pending" transitively
    /// through `release_stale`).
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, queues = ?self.config.queues, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let leased = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.queue.lease(&self.config.queues, &self.config.worker_id, self.config.visibility_timeout) => result,
            };

            match leased {
                Ok(Some(job)) => self.dispatch(job, shutdown.clone()).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_SLEEP) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "lease attempt failed");
                    tokio::time::sleep(POLL_SLEEP).await;
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn dispatch(&self, job: Job, shutdown: CancellationToken) {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered for job type");
            if let Err(e) = self.queue.fail(job.id, "no handler registered").await {
                error!(job_id = %job.id, error = %e, "failed to record missing-handler failure");
            }
            return;
        };

        let job_cancel = shutdown.child_token();
        let job_id = job.id;
        let heartbeat_queue = self.queue.clone();
        let heartbeat_worker_id = self.config.worker_id.clone();
        let heartbeat_cancel = job_cancel.clone();

        // Extends the job's own lease while the handler runs, independent
        // of whatever ScrapingJob heartbeat the handler itself maintains
        // (§4.3's 30s worker heartbeat is about keeping the *job* lease
        // alive for long-running handlers, not the scraping-job row).
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = tokio::time::sleep(LEASE_EXTENSION_INTERVAL) => {
                        if let Err(e) = heartbeat_queue.extend_lease(job_id, &heartbeat_worker_id).await {
                            warn!(job_id = %job_id, error = %e, "lease heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = handler.handle(&job, job_cancel.clone()).await;
        job_cancel.cancel();
        heartbeat_task.abort();

        match result {
            Ok(value) => {
                if let Err(e) = self.queue.complete(job.id, value).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(HandlerError::Cancelled) => {
                if let Err(e) = self.queue.fail(job.id, "cancelled").await {
                    error!(job_id = %job.id, error = %e, "failed to record cancellation");
                }
            }
            Err(HandlerError::Failed(err)) => {
                warn!(job_id = %job.id, error = %err, "handler failed");
                if let Err(e) = self.queue.fail(job.id, &err.to_string()).await {
                    error!(job_id = %job.id, error = %e, "failed to record handler failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<serde_json::Value, HandlerError> {
            Ok(job.payload.clone().unwrap_or(serde_json::json!({})))
        }
    }

    #[test]
    fn registry_resolves_by_job_type() {
        let registry = HandlerRegistry::new().register("scrape_full", Arc::new(EchoHandler));
        assert!(registry.get("scrape_full").is_some());
        assert!(registry.get("unregistered").is_none());
    }
}
