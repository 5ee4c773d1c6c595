//! Scraper Engine (§4.6): drives a `RegistryAdapter` end-to-end for one
//! `ScrapingJob` — checkpoint/resume loop, per-record upsert, periodic
//! checkpointing, and the date-window fallback sweep. Grounded on
//! `intelligent-crawler/src/crawler.rs::crawl_site`'s
//! checkpoint-then-dedupe-then-persist loop, generalized from "crawl a
//! site" to "enumerate a registry".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use registries::{Cursor, RegistryAdapter, RegistryError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domains::monitoring::{AlertSeverity, AlertType, MonitoringRepository};
use crate::kernel::rate_limiter::full_jitter_backoff;
use crate::kernel::CheckpointStore;

use super::job::ScrapingJobRepository;
use crate::domains::trials::effects::TrialRepository;

const CHECKPOINT_EVERY: usize = 100;
const MAX_BATCH_RETRIES: u32 = 5;
const BATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const BATCH_BACKOFF_CAP: Duration = Duration::from_secs(60);
const FALLBACK_SWEEP_WINDOW_DAYS: i64 = 30;

/// §7 "Upstream schema change": a batch whose normalization failures exceed
/// this fraction of records processed indicates the registry changed its
/// response shape rather than a handful of malformed individual records.
const NORMALIZATION_FAILURE_RATIO_THRESHOLD: f64 = 0.05;

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("cancelled")]
    Cancelled,
    #[error("scraping job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ScraperEngine {
    adapter: Arc<dyn RegistryAdapter>,
    trials: TrialRepository,
    checkpoints: Arc<CheckpointStore>,
    scraping_jobs: Arc<ScrapingJobRepository>,
    monitoring: MonitoringRepository,
}

impl ScraperEngine {
    pub fn new(
        adapter: Arc<dyn RegistryAdapter>,
        trials: TrialRepository,
        checkpoints: Arc<CheckpointStore>,
        scraping_jobs: Arc<ScrapingJobRepository>,
        monitoring: MonitoringRepository,
    ) -> Self {
        Self {
            adapter,
            trials,
            checkpoints,
            scraping_jobs,
            monitoring,
        }
    }

    /// Runs the full §4.6 algorithm for `scraping_job_id`.
    pub async fn run(&self, scraping_job_id: Uuid, cancel: CancellationToken) -> Result<(), ScraperError> {
        let job = self
            .scraping_jobs
            .find(scraping_job_id)
            .await?
            .ok_or(ScraperError::NotFound(scraping_job_id))?;

        let mut processed = job.processed_items;
        let mut failed = job.failed_items;

        // Step 1: resume from the latest checkpoint, or the adapter's
        // initial cursor if this job has never checkpointed.
        let mut cursor = match self.checkpoints.latest(scraping_job_id).await? {
            Some(cp) => serde_json::from_value::<Option<Cursor>>(cp.data.get("cursor").cloned().unwrap_or(serde_json::Value::Null)).unwrap_or(None),
            None => None,
        };

        // Step 2: drive the adapter's normal pagination to completion.
        self.drain_pages(scraping_job_id, &mut cursor, &mut processed, &mut failed, &cancel)
            .await?;

        // Step 3: date-window fallback sweep, catching cursor-gap misses.
        // Records already present are no-ops via upsert (§4.6 step 3).
        self.fallback_sweep(scraping_job_id, &mut processed, &mut failed, &cancel).await?;

        // Step 4: mark complete.
        self.scraping_jobs.mark_completed(scraping_job_id, processed).await?;
        info!(scraping_job_id = %scraping_job_id, processed, failed, "scraping job completed");
        Ok(())
    }

    async fn drain_pages(
        &self,
        scraping_job_id: Uuid,
        cursor: &mut Option<Cursor>,
        processed: &mut i64,
        failed: &mut i64,
        cancel: &CancellationToken,
    ) -> Result<(), ScraperError> {
        let mut since_checkpoint = 0usize;
        let mut batch_total = 0usize;
        let mut batch_norm_failed = 0usize;
        loop {
            if cancel.is_cancelled() {
                self.persist_checkpoint(scraping_job_id, cursor, *processed).await?;
                return Err(ScraperError::Cancelled);
            }

            let page = self.enumerate_with_retry(scraping_job_id, cursor.clone()).await?;
            for record in &page.records {
                if self.normalize_and_upsert(scraping_job_id, record, processed, failed).await {
                    batch_norm_failed += 1;
                }
                batch_total += 1;
                since_checkpoint += 1;
                if since_checkpoint >= CHECKPOINT_EVERY {
                    self.check_normalization_failure_ratio(scraping_job_id, batch_norm_failed, batch_total).await;
                    batch_total = 0;
                    batch_norm_failed = 0;
                    self.persist_checkpoint(scraping_job_id, cursor, *processed).await?;
                    self.scraping_jobs
                        .heartbeat(scraping_job_id, *processed, *failed, serde_json::json!({"phase": "pagination"}))
                        .await?;
                    since_checkpoint = 0;
                }
            }

            *cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        self.check_normalization_failure_ratio(scraping_job_id, batch_norm_failed, batch_total).await;
        self.persist_checkpoint(scraping_job_id, cursor, *processed).await?;
        Ok(())
    }

    async fn fallback_sweep(
        &self,
        scraping_job_id: Uuid,
        processed: &mut i64,
        failed: &mut i64,
        cancel: &CancellationToken,
    ) -> Result<(), ScraperError> {
        let now = Utc::now();
        let mut window_end = now;
        let mut any_support = false;

        // Walk backwards in 30-day chunks; stop once the adapter reports it
        // has no windowed query path at all (checked on the first chunk).
        loop {
            if cancel.is_cancelled() {
                return Err(ScraperError::Cancelled);
            }
            let window_start = window_end - chrono::Duration::days(FALLBACK_SWEEP_WINDOW_DAYS);
            let Some(mut window_cursor) = self.adapter.date_window_cursor(window_start, window_end) else {
                if !any_support {
                    info!(scraping_job_id = %scraping_job_id, "adapter has no date-windowed query path, skipping fallback sweep");
                }
                break;
            };
            any_support = true;

            loop {
                let page = self.enumerate_with_retry(scraping_job_id, Some(window_cursor.clone())).await?;
                let mut page_norm_failed = 0usize;
                for record in &page.records {
                    if self.normalize_and_upsert(scraping_job_id, record, processed, failed).await {
                        page_norm_failed += 1;
                    }
                }
                self.check_normalization_failure_ratio(scraping_job_id, page_norm_failed, page.records.len()).await;
                match page.next_cursor {
                    Some(next) => window_cursor = next,
                    None => break,
                }
            }

            // Stop once the window reaches the start of the registry's
            // history; an adapter with a bounded earliest date should
            // simply keep returning empty pages, which still terminates
            // via the 5-year backstop below.
            window_end = window_start;
            if now - window_end > chrono::Duration::days(365 * 5) {
                break;
            }
        }

        self.scraping_jobs
            .heartbeat(scraping_job_id, *processed, *failed, serde_json::json!({"phase": "fallback_sweep"}))
            .await?;
        Ok(())
    }

    /// Returns `true` when the record failed at the `adapter.normalize()`
    /// step specifically, so callers can track the §7 schema-change ratio
    /// separately from malformed-key drops and upsert failures.
    async fn normalize_and_upsert(
        &self,
        scraping_job_id: Uuid,
        record: &registries::RawRecord,
        processed: &mut i64,
        failed: &mut i64,
    ) -> bool {
        let trial = match self.adapter.normalize(record) {
            Ok(trial) => trial,
            Err(e) => {
                *failed += 1;
                warn!(scraping_job_id = %scraping_job_id, native_id = %record.native_id, error = %e, "normalization failed");
                let _ = self.scraping_jobs.append_error(scraping_job_id, &format!("normalize({}): {e}", record.native_id)).await;
                return true;
            }
        };

        if !is_valid_trial_key(&trial.trial_key) {
            // §4.6 edge-case policy: malformed trial_key is dropped and
            // logged, but NOT counted as processed, so a corrected record
            // from a future run is retried rather than permanently skipped.
            warn!(scraping_job_id = %scraping_job_id, trial_key = %trial.trial_key, "dropping record with malformed trial_key");
            let _ = self.scraping_jobs.append_error(scraping_job_id, &format!("malformed trial_key: {}", trial.trial_key)).await;
            return false;
        }

        match self.trials.upsert(&trial).await {
            Ok(()) => *processed += 1,
            Err(e) => {
                *failed += 1;
                warn!(scraping_job_id = %scraping_job_id, trial_key = %trial.trial_key, error = %e, "upsert failed");
                let _ = self.scraping_jobs.append_error(scraping_job_id, &format!("upsert({}): {e}", trial.trial_key)).await;
            }
        }
        false
    }

    /// Raises a critical alert when a batch's normalization-only failure
    /// rate exceeds the §7 threshold, the signal that a registry changed
    /// its response schema rather than sent a handful of bad records.
    async fn check_normalization_failure_ratio(&self, scraping_job_id: Uuid, norm_failed: usize, batch_size: usize) {
        if batch_size == 0 {
            return;
        }
        let ratio = norm_failed as f64 / batch_size as f64;
        if ratio > NORMALIZATION_FAILURE_RATIO_THRESHOLD {
            warn!(scraping_job_id = %scraping_job_id, ratio, norm_failed, batch_size, "normalization failure ratio exceeds threshold");
            let _ = self
                .monitoring
                .raise_alert(
                    AlertType::Error,
                    AlertSeverity::Critical,
                    "normalization failure ratio exceeds 5% for a batch, possible upstream schema change",
                    serde_json::json!({
                        "scraping_job_id": scraping_job_id,
                        "normalization_failed": norm_failed,
                        "batch_size": batch_size,
                        "ratio": ratio,
                    }),
                )
                .await;
        }
    }

    /// Batch-request retries: exponential backoff up to 5 attempts, then
    /// propagate so the job fails with its checkpoint left intact (§4.6).
    async fn enumerate_with_retry(
        &self,
        scraping_job_id: Uuid,
        cursor: Option<Cursor>,
    ) -> Result<registries::EnumeratePage, ScraperError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.adapter.enumerate(cursor.clone()).await {
                Ok(page) => return Ok(page),
                Err(RegistryError::ManualImportRequired { registry, expected_path }) => {
                    info!(scraping_job_id = %scraping_job_id, registry, expected_path, "bulk file not present, operator action required");
                    return Ok(registries::EnumeratePage {
                        records: vec![],
                        next_cursor: None,
                        total_estimate: None,
                    });
                }
                Err(e) if attempt < MAX_BATCH_RETRIES => {
                    let backoff = full_jitter_backoff(attempt, BATCH_BACKOFF_BASE, BATCH_BACKOFF_CAP);
                    warn!(scraping_job_id = %scraping_job_id, attempt, error = %e, "enumerate failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.scraping_jobs.mark_failed(scraping_job_id, &e.to_string()).await.ok();
                    return Err(e.into());
                }
            }
        }
    }

    async fn persist_checkpoint(
        &self,
        scraping_job_id: Uuid,
        cursor: &Option<Cursor>,
        processed: i64,
    ) -> Result<(), ScraperError> {
        let data = serde_json::json!({ "cursor": cursor });
        self.checkpoints
            .persist(scraping_job_id, "pagination", data.clone(), processed)
            .await?;
        self.scraping_jobs.persist_checkpoint_cursor(scraping_job_id, data).await?;
        Ok(())
    }
}

fn is_valid_trial_key(key: &str) -> bool {
    match key.split_once(':') {
        Some((source, native_id)) => !source.trim().is_empty() && !native_id.trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_key_validity_requires_nonempty_source_and_id() {
        assert!(is_valid_trial_key("ctgov:nct01"));
        assert!(!is_valid_trial_key("ctgov:"));
        assert!(!is_valid_trial_key(":nct01"));
        assert!(!is_valid_trial_key("malformed"));
    }
}
