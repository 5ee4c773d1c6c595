//! Matcher orchestration: embeds the patient profile, runs the vector and
//! keyword passes, applies the eligibility filter, and scores survivors.
//! The pgvector cosine query is grounded on
//! `domains::matching::effects::vector_search::find_members_statewide`.

use std::collections::HashMap;

use anyhow::Result;
use registries::{Eligibility, Gender};
use sqlx::PgPool;
use tracing::{info, instrument};

use super::scoring::{self, is_eligible, location_score, rank, PatientLocation, PatientProfile, ScoredTrial};
use crate::domains::trials::embedding::TrialEmbeddingRepository;

#[derive(Debug, Clone, sqlx::FromRow)]
struct KeywordCandidate {
    trial_key: String,
    rank: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EligibilityRow {
    trial_key: String,
    eligibility: serde_json::Value,
    locations: serde_json::Value,
}

pub struct Matcher {
    pool: PgPool,
    embeddings: TrialEmbeddingRepository,
}

impl Matcher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            embeddings: TrialEmbeddingRepository::new(pool.clone()),
            pool,
        }
    }

    /// §4.9 steps 3-7. `patient_embedding` is produced upstream by an
    /// embeddings call over `profile.canonical_text()`.
    #[instrument(skip(self, patient_embedding, profile))]
    pub async fn match_trials(
        &self,
        profile: &PatientProfile,
        patient_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredTrial>> {
        let k = scoring::CANDIDATE_MULTIPLIER * limit;

        let vector_candidates = self
            .embeddings
            .search_by_similarity(patient_embedding, scoring::VECTOR_SIMILARITY_FLOOR, k as i64)
            .await?;

        let keyword_query = [&profile.conditions[..], &profile.symptoms[..], &profile.prior_treatments[..]]
            .concat()
            .join(" ");
        let keyword_candidates = self.keyword_search(&keyword_query, k).await?;

        let mut vector_scores: HashMap<String, f64> = HashMap::new();
        for c in &vector_candidates {
            vector_scores.insert(c.trial_key.clone(), c.similarity);
        }

        let max_keyword_rank = keyword_candidates
            .iter()
            .map(|c| c.rank)
            .fold(0.0_f64, f64::max)
            .max(f64::MIN_POSITIVE);
        let mut keyword_scores: HashMap<String, f64> = HashMap::new();
        for c in &keyword_candidates {
            keyword_scores.insert(c.trial_key.clone(), c.rank / max_keyword_rank);
        }

        let mut all_keys: Vec<String> = vector_scores.keys().cloned().collect();
        for k in keyword_scores.keys() {
            if !all_keys.contains(k) {
                all_keys.push(k.clone());
            }
        }

        let eligibility_rows = self.fetch_eligibility(&all_keys).await?;

        let mut scored = Vec::new();
        for row in eligibility_rows {
            let eligibility: Eligibility = serde_json::from_value(row.eligibility.clone()).unwrap_or(Eligibility {
                inclusion_text: None,
                exclusion_text: None,
                gender: Gender::All,
                min_age: None,
                max_age: None,
            });
            if !is_eligible(&eligibility, profile.age_days, profile.gender) {
                continue;
            }

            let locations: Vec<registries::TrialLocation> =
                serde_json::from_value(row.locations.clone()).unwrap_or_default();
            let patient_location = PatientLocation {
                city: profile.location.city.clone(),
                state: profile.location.state.clone(),
                country: profile.location.country.clone(),
            };
            let loc_score = location_score(&patient_location, &locations);

            let vector = *vector_scores.get(&row.trial_key).unwrap_or(&0.0);
            let keyword = *keyword_scores.get(&row.trial_key).unwrap_or(&0.0);

            scored.push(scoring::final_score(&row.trial_key, vector, keyword, 1.0, loc_score));
        }

        let ranked = rank(scored);
        info!(candidates = ranked.len(), "matcher produced ranked candidates");
        Ok(ranked.into_iter().take(limit).collect())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<KeywordCandidate>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, KeywordCandidate>(
            r#"
            SELECT trial_key,
                   ts_rank(
                       to_tsvector('english', title_official || ' ' || array_to_string(conditions, ' ')),
                       plainto_tsquery('english', $1)
                   ) AS rank
            FROM clinical_trials
            WHERE is_active = true
              AND to_tsvector('english', title_official || ' ' || array_to_string(conditions, ' '))
                  @@ plainto_tsquery('english', $1)
            ORDER BY rank DESC
            LIMIT $2
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn fetch_eligibility(&self, trial_keys: &[String]) -> Result<Vec<EligibilityRow>> {
        if trial_keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, EligibilityRow>(
            r#"
            SELECT trial_key, eligibility, locations
            FROM clinical_trials
            WHERE trial_key = ANY($1) AND is_active = true
            "#,
        )
        .bind(trial_keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
