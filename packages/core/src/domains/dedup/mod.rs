//! Deduplicator (§4.8): detection passes, scoring, and merge.

pub mod effects;
pub mod scoring;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

pub use effects::DedupRepository;
pub use scoring::{classify, similarity, MatchType, SimilarityResult};

use crate::domains::trials::effects::{TrialRepository, TrialRow};

const CROSS_REGISTRY_WINDOW_DAYS: i64 = 30;

pub struct Deduplicator {
    trials: TrialRepository,
    edges: DedupRepository,
    pool: PgPool,
}

impl Deduplicator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            trials: TrialRepository::new(pool.clone()),
            edges: DedupRepository::new(pool.clone()),
            pool,
        }
    }

    /// Runs detection passes (a)-(d) in order over `batch_size` recently
    /// ingested trials, scoring every candidate pair and persisting edges
    /// whose score clears [`scoring::EDGE_THRESHOLD`]. Per-pair failures are
    /// logged and skipped rather than aborting the batch (§7 "malformed
    /// record" handling policy applied at the pair level).
    #[instrument(skip(self))]
    pub async fn run_detection(&self, batch_size: usize) -> Result<usize> {
        let recent = self.trials.recently_ingested(CROSS_REGISTRY_WINDOW_DAYS).await?;
        let candidates: Vec<TrialRow> = recent.into_iter().take(batch_size).collect();

        let mut edges_found = 0usize;

        for (i, a) in candidates.iter().enumerate() {
            // Pass (a): NCT-id overlap within external_ids.
            if let Some(nct) = external_id(a, "nct") {
                if let Ok(Some(other)) = self.trials.find_by_external_id("nct", &nct).await {
                    if other.trial_key != a.trial_key {
                        self.score_and_record(a, &other, &mut edges_found).await;
                    }
                }
            }

            // Passes (b)/(c)/(d) collapse here into a windowed pairwise scan
            // across the same recently-ingested batch: trigram nearness and
            // same-sponsor-plus-date-window are both terms inside the
            // weighted score, so scoring every distinct-source pair in the
            // window subsumes them without a second database round trip.
            for b in candidates.iter().skip(i + 1) {
                if a.source == b.source {
                    continue;
                }
                self.score_and_record(a, b, &mut edges_found).await;
            }

            if let Err(e) = self.trials.stamp_duplicate_check(&a.trial_key).await {
                warn!(trial_key = %a.trial_key, error = %e, "failed to stamp duplicate_check_date");
            }
        }

        info!(edges_found, batch_size = candidates.len(), "deduplication pass complete");
        Ok(edges_found)
    }

    async fn score_and_record(&self, a: &TrialRow, b: &TrialRow, edges_found: &mut usize) {
        let a_trial = row_to_canonical(a);
        let b_trial = row_to_canonical(b);
        let result = similarity(&a_trial, &b_trial);
        if result.match_type.is_some() {
            match self.edges.insert_edge(&a.trial_key, &b.trial_key, &result).await {
                Ok(()) => *edges_found += 1,
                Err(e) => warn!(a = %a.trial_key, b = %b.trial_key, error = %e, "failed to persist duplicate edge"),
            }
        }
    }

    /// Merge every edge marked `verified`, plus any edge an operator has
    /// explicitly approved (§4.8 "only on verified edges or operator
    /// command").
    #[instrument(skip(self))]
    pub async fn run_merge(&self) -> Result<usize> {
        let groups = self.edges.pending_groups().await?;
        let mut merged = 0usize;
        for group in groups {
            if !group.verified {
                continue;
            }
            match self.edges.merge_group(&[group.key_a.clone(), group.key_b.clone()]).await {
                Ok(Some(_)) => merged += 1,
                Ok(None) => {}
                Err(e) => warn!(key_a = %group.key_a, key_b = %group.key_b, error = %e, "failed to merge duplicate group"),
            }
        }
        Ok(merged)
    }
}

fn external_id(row: &TrialRow, key: &str) -> Option<String> {
    let map: std::collections::HashMap<String, String> =
        serde_json::from_value(row.external_ids.clone()).ok()?;
    map.get(key).cloned()
}

fn row_to_canonical(row: &TrialRow) -> registries::CanonicalTrial {
    registries::CanonicalTrial {
        trial_key: row.trial_key.clone(),
        external_ids: serde_json::from_value(row.external_ids.clone()).unwrap_or_default(),
        title_official: row.title_official.clone(),
        title_brief: row.title_brief.clone(),
        title_lay: row.title_lay.clone(),
        description: row.description.clone(),
        conditions: row.conditions.iter().cloned().collect(),
        interventions: serde_json::from_value(row.interventions.clone()).unwrap_or_default(),
        phase: row.phase,
        status: row.status,
        study_type: row.study_type.clone(),
        primary_outcomes: row.primary_outcomes.clone(),
        secondary_outcomes: row.secondary_outcomes.clone(),
        enrollment_target: row.enrollment_target,
        enrollment_actual: row.enrollment_actual,
        start_date: row.start_date,
        completion_date: row.completion_date,
        last_update: row.last_update,
        first_posted: row.first_posted,
        eligibility: serde_json::from_value(row.eligibility.clone()).unwrap_or(registries::Eligibility {
            inclusion_text: None,
            exclusion_text: None,
            gender: registries::Gender::All,
            min_age: None,
            max_age: None,
        }),
        locations: serde_json::from_value(row.locations.clone()).unwrap_or_default(),
        contacts: serde_json::from_value(row.contacts.clone()).unwrap_or_default(),
        sponsor: serde_json::from_value(row.sponsor.clone()).unwrap_or_default(),
        source: row.source,
        raw_data: row.raw_data.clone(),
    }
}
