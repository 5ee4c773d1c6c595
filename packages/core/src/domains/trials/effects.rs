//! Upsert and merge mutations against `clinical_trials`. The diff-merge
//! algorithm lives here in Rust rather than in SQL, mirroring how the
//! reference service's `apply_dedup_results` keeps merge policy as plain
//! Rust logic operating over rows it already has in hand.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use registries::{
    CanonicalTrial, Eligibility, Intervention, Phase, Registry, Sponsor, TrialContact,
    TrialLocation, TrialStatus,
};
use sqlx::PgPool;
use tracing::{info, instrument};

/// Row shape for `clinical_trials`. Nested structures are stored as JSONB;
/// `conditions`/`primary_outcomes`/`secondary_outcomes` are native Postgres
/// arrays since they are flat string sets.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrialRow {
    pub trial_key: String,
    pub external_ids: serde_json::Value,
    pub title_official: String,
    pub title_brief: Option<String>,
    pub title_lay: Option<String>,
    pub description: Option<String>,
    pub conditions: Vec<String>,
    pub interventions: serde_json::Value,
    pub phase: Phase,
    pub status: TrialStatus,
    pub study_type: Option<String>,
    pub primary_outcomes: Vec<String>,
    pub secondary_outcomes: Vec<String>,
    pub enrollment_target: Option<i32>,
    pub enrollment_actual: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub first_posted: Option<DateTime<Utc>>,
    pub eligibility: serde_json::Value,
    pub locations: serde_json::Value,
    pub contacts: serde_json::Value,
    pub sponsor: serde_json::Value,
    pub source: Registry,
    pub raw_data: serde_json::Value,
    pub is_active: bool,
    pub merged_into_key: Option<String>,
    pub duplicate_check_date: Option<DateTime<Utc>>,
}

impl TrialRow {
    pub(crate) fn conditions_set(&self) -> HashSet<String> {
        self.conditions.iter().cloned().collect()
    }

    pub(crate) fn interventions_vec(&self) -> Vec<Intervention> {
        serde_json::from_value(self.interventions.clone()).unwrap_or_default()
    }

    fn locations_vec(&self) -> Vec<TrialLocation> {
        serde_json::from_value(self.locations.clone()).unwrap_or_default()
    }

    /// Public accessor for consumers outside this module (the geocode
    /// handler, the deduplicator's merge) that need to read a trial's
    /// locations.
    pub fn locations(&self) -> Vec<TrialLocation> {
        self.locations_vec()
    }

    pub(crate) fn contacts_vec(&self) -> Vec<TrialContact> {
        serde_json::from_value(self.contacts.clone()).unwrap_or_default()
    }

    pub(crate) fn sponsor(&self) -> Sponsor {
        serde_json::from_value(self.sponsor.clone()).unwrap_or_default()
    }

    pub(crate) fn external_ids_map(&self) -> HashMap<String, String> {
        serde_json::from_value(self.external_ids.clone()).unwrap_or_default()
    }

    /// Same derivation as `CanonicalTrial::embedding_source_text`, off the
    /// persisted row instead of a freshly normalized trial, so the
    /// enrichment handler doesn't need to re-fetch from the source registry.
    pub fn embedding_source_text(&self) -> String {
        let conditions = self.conditions.join(", ");
        let interventions = self
            .interventions_vec()
            .into_iter()
            .map(|i| i.name)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{}. {} Conditions: {}. Interventions: {}.",
            self.title_official,
            self.description.clone().unwrap_or_default(),
            conditions,
            interventions
        )
    }

    pub fn source_text_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.embedding_source_text().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Clone)]
pub struct TrialRepository {
    pool: PgPool,
}

impl TrialRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_key(&self, trial_key: &str) -> Result<Option<TrialRow>> {
        let row = sqlx::query_as::<_, TrialRow>(
            r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                      description, conditions, interventions, phase, status, study_type,
                      primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                      start_date, completion_date, last_update, first_posted, eligibility,
                      locations, contacts, sponsor, source, raw_data, is_active,
                      merged_into_key, duplicate_check_date
               FROM clinical_trials WHERE trial_key = $1"#,
        )
        .bind(trial_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up any active trial whose `external_ids` already contains
    /// `value` for `key`. Used by the deduplicator's NCT-id overlap pass
    /// (§4.8 detection pass (a)).
    pub async fn find_by_external_id(&self, key: &str, value: &str) -> Result<Option<TrialRow>> {
        let row = sqlx::query_as::<_, TrialRow>(
            r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                      description, conditions, interventions, phase, status, study_type,
                      primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                      start_date, completion_date, last_update, first_posted, eligibility,
                      locations, contacts, sponsor, source, raw_data, is_active,
                      merged_into_key, duplicate_check_date
               FROM clinical_trials
               WHERE is_active = true AND external_ids ->> $1 = $2
               LIMIT 1"#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Upsert a normalized trial, applying the §3 diff-merge rule when a
    /// row with the same `trial_key` already exists: arrays unioned, scalar
    /// fields overwritten only if the incoming value is non-empty and the
    /// incoming source's `last_update` is newer.
    #[instrument(skip(self, incoming), fields(trial_key = %incoming.trial_key))]
    pub async fn upsert(&self, incoming: &CanonicalTrial) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, TrialRow>(
            r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                      description, conditions, interventions, phase, status, study_type,
                      primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                      start_date, completion_date, last_update, first_posted, eligibility,
                      locations, contacts, sponsor, source, raw_data, is_active,
                      merged_into_key, duplicate_check_date
               FROM clinical_trials WHERE trial_key = $1 FOR UPDATE"#,
        )
        .bind(&incoming.trial_key)
        .fetch_optional(&mut *tx)
        .await?;

        let merged = match existing {
            None => MergedTrial::from_fresh(incoming),
            Some(existing) => MergedTrial::merge(&existing, incoming),
        };

        sqlx::query(
            r#"
            INSERT INTO clinical_trials (
                trial_key, external_ids, title_official, title_brief, title_lay, description,
                conditions, interventions, phase, status, study_type, primary_outcomes,
                secondary_outcomes, enrollment_target, enrollment_actual, start_date,
                completion_date, last_update, first_posted, eligibility, locations, contacts,
                sponsor, source, raw_data, is_active, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                $19, $20, $21, $22, $23, $24, $25, true, NOW(), NOW()
            )
            ON CONFLICT (trial_key) DO UPDATE SET
                external_ids = EXCLUDED.external_ids,
                title_official = EXCLUDED.title_official,
                title_brief = EXCLUDED.title_brief,
                title_lay = EXCLUDED.title_lay,
                description = EXCLUDED.description,
                conditions = EXCLUDED.conditions,
                interventions = EXCLUDED.interventions,
                phase = EXCLUDED.phase,
                status = EXCLUDED.status,
                study_type = EXCLUDED.study_type,
                primary_outcomes = EXCLUDED.primary_outcomes,
                secondary_outcomes = EXCLUDED.secondary_outcomes,
                enrollment_target = EXCLUDED.enrollment_target,
                enrollment_actual = EXCLUDED.enrollment_actual,
                start_date = EXCLUDED.start_date,
                completion_date = EXCLUDED.completion_date,
                last_update = EXCLUDED.last_update,
                first_posted = EXCLUDED.first_posted,
                eligibility = EXCLUDED.eligibility,
                locations = EXCLUDED.locations,
                contacts = EXCLUDED.contacts,
                sponsor = EXCLUDED.sponsor,
                source = EXCLUDED.source,
                raw_data = EXCLUDED.raw_data,
                updated_at = NOW()
            "#,
        )
        .bind(&merged.trial_key)
        .bind(serde_json::to_value(&merged.external_ids)?)
        .bind(&merged.title_official)
        .bind(&merged.title_brief)
        .bind(&merged.title_lay)
        .bind(&merged.description)
        .bind(&merged.conditions)
        .bind(serde_json::to_value(&merged.interventions)?)
        .bind(merged.phase)
        .bind(merged.status)
        .bind(&merged.study_type)
        .bind(&merged.primary_outcomes)
        .bind(&merged.secondary_outcomes)
        .bind(merged.enrollment_target)
        .bind(merged.enrollment_actual)
        .bind(merged.start_date)
        .bind(merged.completion_date)
        .bind(merged.last_update)
        .bind(merged.first_posted)
        .bind(serde_json::to_value(&merged.eligibility)?)
        .bind(serde_json::to_value(&merged.locations)?)
        .bind(serde_json::to_value(&merged.contacts)?)
        .bind(serde_json::to_value(&merged.sponsor)?)
        .bind(merged.source)
        .bind(&merged.raw_data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("upserted canonical trial");
        Ok(())
    }

    /// Active trials ingested within the last `days` days, for the
    /// cross-registry dedup pass (§4.8 detection pass (d)).
    pub async fn recently_ingested(&self, days: i64) -> Result<Vec<TrialRow>> {
        let rows = sqlx::query_as::<_, TrialRow>(
            r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                      description, conditions, interventions, phase, status, study_type,
                      primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                      start_date, completion_date, last_update, first_posted, eligibility,
                      locations, contacts, sponsor, source, raw_data, is_active,
                      merged_into_key, duplicate_check_date
               FROM clinical_trials
               WHERE is_active = true AND created_at >= NOW() - ($1 || ' days')::INTERVAL"#,
        )
        .bind(days.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Page of active trials ordered by most-recently-updated first, for
    /// the enrichment handler's embedding-refresh sweep (§4.1 "Enrich").
    pub async fn active_page(&self, limit: i64, offset: i64) -> Result<Vec<TrialRow>> {
        let rows = sqlx::query_as::<_, TrialRow>(
            r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                      description, conditions, interventions, phase, status, study_type,
                      primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                      start_date, completion_date, last_update, first_posted, eligibility,
                      locations, contacts, sponsor, source, raw_data, is_active,
                      merged_into_key, duplicate_check_date
               FROM clinical_trials
               WHERE is_active = true
               ORDER BY updated_at DESC
               LIMIT $1 OFFSET $2"#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Persists geocoded coordinates onto a trial's locations (§4.1
    /// "Geocode"). The geocode handler reads `active_page`/`find_by_key`,
    /// fills in missing `latitude`/`longitude` per location, and writes the
    /// whole array back here rather than updating a single JSONB path, since
    /// `TrialLocation` has no stable per-element id to address by.
    pub async fn update_locations(&self, trial_key: &str, locations: &[TrialLocation]) -> Result<()> {
        sqlx::query("UPDATE clinical_trials SET locations = $2, updated_at = NOW() WHERE trial_key = $1")
            .bind(trial_key)
            .bind(serde_json::to_value(locations)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stamp_duplicate_check(&self, trial_key: &str) -> Result<()> {
        sqlx::query("UPDATE clinical_trials SET duplicate_check_date = NOW() WHERE trial_key = $1")
            .bind(trial_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a trial absorbed by a merge: `is_active = false`,
    /// `merged_into_key` set (§4.8 merge step 4).
    pub async fn mark_merged(&self, duplicate_key: &str, primary_key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE clinical_trials SET is_active = false, merged_into_key = $2, updated_at = NOW() WHERE trial_key = $1",
        )
        .bind(duplicate_key)
        .bind(primary_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Scalar-field diff-merge rule shared by `MergedTrial::merge` (§3 upsert)
/// and the deduplicator's group merge (§4.8): `incoming` wins only if it is
/// both newer and non-empty, otherwise the non-empty side wins.
pub(crate) fn pick_scalar<T: Clone>(existing: Option<T>, incoming: Option<T>, incoming_is_newer: bool) -> Option<T> {
    if incoming_is_newer && incoming.is_some() {
        incoming
    } else {
        existing.or(incoming)
    }
}

pub(crate) fn pick_string(existing: &str, incoming: &str, incoming_is_newer: bool) -> String {
    if incoming_is_newer && !incoming.is_empty() {
        incoming.to_string()
    } else if !existing.is_empty() {
        existing.to_string()
    } else {
        incoming.to_string()
    }
}

/// Plain-data merge result, assembled in Rust so the SQL statement above
/// stays a dumb upsert.
struct MergedTrial {
    trial_key: String,
    external_ids: HashMap<String, String>,
    title_official: String,
    title_brief: Option<String>,
    title_lay: Option<String>,
    description: Option<String>,
    conditions: Vec<String>,
    interventions: Vec<Intervention>,
    phase: Phase,
    status: TrialStatus,
    study_type: Option<String>,
    primary_outcomes: Vec<String>,
    secondary_outcomes: Vec<String>,
    enrollment_target: Option<i32>,
    enrollment_actual: Option<i32>,
    start_date: Option<DateTime<Utc>>,
    completion_date: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    first_posted: Option<DateTime<Utc>>,
    eligibility: Eligibility,
    locations: Vec<TrialLocation>,
    contacts: Vec<TrialContact>,
    sponsor: Sponsor,
    source: Registry,
    raw_data: serde_json::Value,
}

impl MergedTrial {
    fn from_fresh(incoming: &CanonicalTrial) -> Self {
        Self {
            trial_key: incoming.trial_key.clone(),
            external_ids: incoming.external_ids.clone(),
            title_official: incoming.title_official.clone(),
            title_brief: incoming.title_brief.clone(),
            title_lay: incoming.title_lay.clone(),
            description: incoming.description.clone(),
            conditions: incoming.conditions.iter().cloned().collect(),
            interventions: incoming.interventions.clone(),
            phase: incoming.phase,
            status: incoming.status,
            study_type: incoming.study_type.clone(),
            primary_outcomes: incoming.primary_outcomes.clone(),
            secondary_outcomes: incoming.secondary_outcomes.clone(),
            enrollment_target: incoming.enrollment_target,
            enrollment_actual: incoming.enrollment_actual,
            start_date: incoming.start_date,
            completion_date: incoming.completion_date,
            last_update: incoming.last_update,
            first_posted: incoming.first_posted,
            eligibility: incoming.eligibility.clone(),
            locations: incoming.locations.clone(),
            contacts: incoming.contacts.clone(),
            sponsor: incoming.sponsor.clone(),
            source: incoming.source,
            raw_data: serde_json::json!([{ "ingested_at": Utc::now(), "data": incoming.raw_data }]),
        }
    }

    /// `incoming` wins on scalar fields only if it is non-empty and newer
    /// (by `last_update`) than what's already stored; arrays are unioned.
    fn merge(existing: &TrialRow, incoming: &CanonicalTrial) -> Self {
        let incoming_is_newer = match (existing.last_update, incoming.last_update) {
            (Some(old), Some(new)) => new >= old,
            (None, Some(_)) => true,
            _ => false,
        };

        let mut external_ids = existing.external_ids_map();
        external_ids.extend(incoming.external_ids.clone());

        let mut conditions: HashSet<String> = existing.conditions_set();
        conditions.extend(incoming.conditions.iter().cloned());

        let mut interventions = existing.interventions_vec();
        for i in &incoming.interventions {
            if !interventions.iter().any(|e| e.name.eq_ignore_ascii_case(&i.name)) {
                interventions.push(i.clone());
            }
        }

        let mut primary_outcomes: HashSet<String> = existing.primary_outcomes.iter().cloned().collect();
        primary_outcomes.extend(incoming.primary_outcomes.iter().cloned());
        let mut secondary_outcomes: HashSet<String> = existing.secondary_outcomes.iter().cloned().collect();
        secondary_outcomes.extend(incoming.secondary_outcomes.iter().cloned());

        let mut locations = existing.locations_vec();
        for l in &incoming.locations {
            if !locations.iter().any(|e| e.overlap_key() == l.overlap_key()) {
                locations.push(l.clone());
            }
        }

        let mut contacts = existing.contacts_vec();
        for c in &incoming.contacts {
            if !contacts.iter().any(|e| e.email.is_some() && e.email == c.email) {
                contacts.push(c.clone());
            }
        }

        let existing_sponsor = existing.sponsor();
        let mut collaborators: HashSet<String> = existing_sponsor.collaborators.into_iter().collect();
        collaborators.extend(incoming.sponsor.collaborators.iter().cloned());
        let sponsor = Sponsor {
            lead: if incoming_is_newer && incoming.sponsor.lead.is_some() {
                incoming.sponsor.lead.clone()
            } else {
                existing_sponsor.lead.or_else(|| incoming.sponsor.lead.clone())
            },
            collaborators: collaborators.into_iter().collect(),
        };

        let mut raw_data = existing.raw_data.clone();
        if let Some(arr) = raw_data.as_array_mut() {
            arr.push(serde_json::json!({ "ingested_at": Utc::now(), "data": incoming.raw_data }));
        }

        Self {
            trial_key: existing.trial_key.clone(),
            external_ids,
            title_official: pick_string(&existing.title_official, &incoming.title_official, incoming_is_newer),
            title_brief: pick_scalar(existing.title_brief.clone(), incoming.title_brief.clone(), incoming_is_newer),
            title_lay: pick_scalar(existing.title_lay.clone(), incoming.title_lay.clone(), incoming_is_newer),
            description: pick_scalar(existing.description.clone(), incoming.description.clone(), incoming_is_newer),
            conditions: conditions.into_iter().collect(),
            interventions,
            phase: if incoming_is_newer && incoming.phase != Phase::Na { incoming.phase } else { existing.phase },
            status: if incoming_is_newer { incoming.status } else { existing.status },
            study_type: pick_scalar(existing.study_type.clone(), incoming.study_type.clone(), incoming_is_newer),
            primary_outcomes: primary_outcomes.into_iter().collect(),
            secondary_outcomes: secondary_outcomes.into_iter().collect(),
            enrollment_target: pick_scalar(existing.enrollment_target, incoming.enrollment_target, incoming_is_newer),
            enrollment_actual: pick_scalar(existing.enrollment_actual, incoming.enrollment_actual, incoming_is_newer),
            start_date: pick_scalar(existing.start_date, incoming.start_date, incoming_is_newer),
            completion_date: pick_scalar(existing.completion_date, incoming.completion_date, incoming_is_newer),
            last_update: std::cmp::max(existing.last_update, incoming.last_update),
            first_posted: existing.first_posted.or(incoming.first_posted),
            eligibility: incoming.eligibility.clone(),
            locations,
            contacts,
            sponsor,
            source: existing.source,
            raw_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_trial() -> CanonicalTrial {
        CanonicalTrial {
            trial_key: "ctgov:nct01".into(),
            external_ids: HashMap::from([("nct".to_string(), "NCT01".to_string())]),
            title_official: "A Study".into(),
            title_brief: None,
            title_lay: None,
            description: None,
            conditions: HashSet::from(["Diabetes".to_string()]),
            interventions: vec![],
            phase: Phase::Phase2,
            status: TrialStatus::Recruiting,
            study_type: None,
            primary_outcomes: vec![],
            secondary_outcomes: vec![],
            enrollment_target: None,
            enrollment_actual: None,
            start_date: None,
            completion_date: None,
            last_update: Some(Utc::now()),
            first_posted: None,
            eligibility: Eligibility {
                inclusion_text: None,
                exclusion_text: None,
                gender: Default::default(),
                min_age: None,
                max_age: None,
            },
            locations: vec![],
            contacts: vec![],
            sponsor: Sponsor::default(),
            source: Registry::CtGov,
            raw_data: serde_json::json!({}),
        }
    }

    #[test]
    fn from_fresh_wraps_raw_data_as_single_element_snapshot_array() {
        let trial = base_trial();
        let merged = MergedTrial::from_fresh(&trial);
        assert_eq!(merged.raw_data.as_array().unwrap().len(), 1);
    }
}
