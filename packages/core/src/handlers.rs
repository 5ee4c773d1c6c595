//! `JobHandler` implementations wiring the durable queue (§4.2/§4.3) to the
//! domain logic each job type drives: scrape, deduplicate, enrich,
//! geocode. Grounded on the reference service's `CommandRegistry` handler
//! dispatch, narrowed to four concrete handlers instead of a generic
//! command bus since this system has a fixed, known set of job types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use registries::{Registry, RegistryAdapter};
use tokio_util::sync::CancellationToken;

use crate::domains::jobs::{HandlerError, Job, JobHandler};
use crate::domains::monitoring::MonitoringRepository;
use crate::domains::scraper::{ScraperEngine, ScrapingJobRepository, ScrapingJobType};
use crate::domains::trials::effects::TrialRepository;
use crate::domains::trials::embedding::TrialEmbeddingRepository;
use crate::kernel::{CheckpointStore, EmbeddingClient, GeocodingClient};

/// Drives a [`ScraperEngine`] run for the registry named in the job
/// payload. Handles both `scrape_full` and `scrape_incremental` job types,
/// distinguished only by the `ScrapingJob`'s recorded type (§4.6 treats
/// both as the same enumerate/normalize/upsert loop; "incremental" differs
/// only in how soon the fallback sweep would otherwise be needed).
pub struct ScrapeHandler {
    adapters: HashMap<Registry, Arc<dyn RegistryAdapter>>,
    trials: TrialRepository,
    checkpoints: Arc<CheckpointStore>,
    scraping_jobs: Arc<ScrapingJobRepository>,
    monitoring: MonitoringRepository,
}

impl ScrapeHandler {
    pub fn new(
        adapters: HashMap<Registry, Arc<dyn RegistryAdapter>>,
        trials: TrialRepository,
        checkpoints: Arc<CheckpointStore>,
        scraping_jobs: Arc<ScrapingJobRepository>,
        monitoring: MonitoringRepository,
    ) -> Self {
        Self {
            adapters,
            trials,
            checkpoints,
            scraping_jobs,
            monitoring,
        }
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<serde_json::Value, HandlerError> {
        let payload = job.payload.clone().unwrap_or_default();
        let registry: Registry = serde_json::from_value(
            payload
                .get("registry")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("scrape job missing `registry`"))?,
        )
        .map_err(|e| anyhow::anyhow!("invalid registry in scrape job payload: {e}"))?;

        let adapter = self
            .adapters
            .get(&registry)
            .ok_or_else(|| anyhow::anyhow!("no adapter registered for {registry:?}"))?
            .clone();

        let job_type = if job.job_type == "scrape_incremental" {
            ScrapingJobType::Incremental
        } else {
            ScrapingJobType::Full
        };

        let scraping_job_id = self
            .scraping_jobs
            .create(registry, job_type, &job.id.to_string())
            .await?;

        let engine = ScraperEngine::new(
            adapter,
            self.trials.clone(),
            self.checkpoints.clone(),
            self.scraping_jobs.clone(),
            self.monitoring.clone(),
        );
        match engine.run(scraping_job_id, cancel).await {
            Ok(()) => Ok(serde_json::json!({"scraping_job_id": scraping_job_id})),
            Err(crate::domains::scraper::ScraperError::Cancelled) => Err(HandlerError::Cancelled),
            Err(e) => Err(HandlerError::Failed(e.into())),
        }
    }
}

/// Drives a [`crate::domains::dedup::Deduplicator`] detection-then-merge
/// pass over `batch_size` recently ingested trials (§4.8).
pub struct DedupHandler {
    dedup: crate::domains::dedup::Deduplicator,
}

impl DedupHandler {
    pub fn new(dedup: crate::domains::dedup::Deduplicator) -> Self {
        Self { dedup }
    }
}

#[async_trait]
impl JobHandler for DedupHandler {
    async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<serde_json::Value, HandlerError> {
        let batch_size = job
            .payload
            .as_ref()
            .and_then(|p| p.get("batch_size"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1000) as usize;

        let edges = self.dedup.run_detection(batch_size).await.map_err(HandlerError::Failed)?;
        let merges = self.dedup.run_merge().await.map_err(HandlerError::Failed)?;
        Ok(serde_json::json!({"edges_found": edges, "groups_merged": merges}))
    }
}

const ENRICH_PAGE_SIZE: i64 = 200;

/// Refreshes embeddings for every active trial whose `source_text_hash` no
/// longer matches the derived embedding text (§4.1 "Enrich").
pub struct EnrichHandler {
    trials: TrialRepository,
    embeddings: TrialEmbeddingRepository,
    client: Arc<dyn EmbeddingClient>,
}

impl EnrichHandler {
    pub fn new(trials: TrialRepository, embeddings: TrialEmbeddingRepository, client: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            trials,
            embeddings,
            client,
        }
    }
}

#[async_trait]
impl JobHandler for EnrichHandler {
    async fn handle(&self, _job: &Job, cancel: CancellationToken) -> Result<serde_json::Value, HandlerError> {
        let mut offset = 0i64;
        let mut refreshed = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let page = self
                .trials
                .active_page(ENRICH_PAGE_SIZE, offset)
                .await
                .map_err(HandlerError::Failed)?;
            if page.is_empty() {
                break;
            }

            for row in &page {
                let hash = row.source_text_hash();
                let stale = self
                    .embeddings
                    .is_stale(&row.trial_key, &hash)
                    .await
                    .map_err(HandlerError::Failed)?;
                if !stale {
                    continue;
                }
                let vector = self
                    .client
                    .generate(&row.embedding_source_text())
                    .await
                    .map_err(HandlerError::Failed)?;
                self.embeddings
                    .upsert(&row.trial_key, &vector, &hash)
                    .await
                    .map_err(HandlerError::Failed)?;
                refreshed += 1;
            }

            offset += page.len() as i64;
        }
        Ok(serde_json::json!({"refreshed": refreshed}))
    }
}

/// Geocodes a single trial's locations that are missing coordinates (§6
/// "Nominatim ... 1 req/sec"). One job per trial keeps each geocode call
/// individually retryable through the job queue's own retry policy rather
/// than needing a bespoke batching scheme.
pub struct GeocodeHandler {
    trials: TrialRepository,
    client: Arc<GeocodingClient>,
}

impl GeocodeHandler {
    pub fn new(trials: TrialRepository, client: Arc<GeocodingClient>) -> Self {
        Self { trials, client }
    }
}

#[async_trait]
impl JobHandler for GeocodeHandler {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<serde_json::Value, HandlerError> {
        let trial_key = job
            .payload
            .as_ref()
            .and_then(|p| p.get("trial_key"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::Failed(anyhow::anyhow!("geocode job missing `trial_key`")))?;

        let Some(row) = self.trials.find_by_key(trial_key).await.map_err(HandlerError::Failed)? else {
            return Err(HandlerError::Failed(anyhow::anyhow!("trial {trial_key} not found")));
        };

        let mut locations = row.locations();
        let mut geocoded = 0usize;
        for location in locations.iter_mut() {
            if cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            if location.latitude.is_some() && location.longitude.is_some() {
                continue;
            }
            let query = [&location.facility, &location.city, &location.state, &location.country]
                .into_iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if query.is_empty() {
                continue;
            }
            match self.client.geocode(&query).await {
                Ok(geo) => {
                    location.latitude = Some(geo.latitude);
                    location.longitude = Some(geo.longitude);
                    geocoded += 1;
                }
                Err(e) => {
                    tracing::warn!(trial_key, query, error = %e, "geocoding failed for location");
                }
            }
        }

        self.trials
            .update_locations(trial_key, &locations)
            .await
            .map_err(HandlerError::Failed)?;
        Ok(serde_json::json!({"trial_key": trial_key, "geocoded": geocoded}))
    }
}
