//! Edge persistence, detection passes, and the transactional merge. Merge
//! mechanics (transactional group processing, per-item warn-and-continue,
//! skip of already-merged rows) are grounded on
//! `domains::posts::effects::deduplication::apply_dedup_results`; the
//! scoring itself is the deterministic function in [`super::scoring`]
//! rather than an LLM call.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use registries::{Intervention, Phase, Sponsor, TrialContact, TrialLocation, TrialStatus};
use sqlx::PgPool;
use tracing::{info, instrument};

use super::scoring::{MatchType, SimilarityResult};
use crate::domains::trials::effects::{pick_scalar, pick_string, TrialRow};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DuplicateEdgeRow {
    pub key_a: String,
    pub key_b: String,
    pub score: f64,
    pub reasons: serde_json::Value,
    pub match_type: MatchType,
    pub verified: bool,
}

pub struct DedupRepository {
    pool: PgPool,
}

impl DedupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Canonical undirected ordering (`min(key) || max(key)`) so the same
    /// pair can never be stored twice and cycles are impossible by
    /// construction (§9).
    fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[instrument(skip(self, result))]
    pub async fn insert_edge(&self, a_key: &str, b_key: &str, result: &SimilarityResult) -> Result<()> {
        let Some(match_type) = result.match_type else {
            return Ok(());
        };
        let (key_a, key_b) = Self::ordered_pair(a_key, b_key);

        sqlx::query(
            r#"
            INSERT INTO trial_duplicates (key_a, key_b, score, reasons, match_type, verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (key_a, key_b) DO UPDATE SET
                score = EXCLUDED.score,
                reasons = EXCLUDED.reasons,
                match_type = EXCLUDED.match_type,
                verified = EXCLUDED.verified
            "#,
        )
        .bind(key_a)
        .bind(key_b)
        .bind(result.score)
        .bind(serde_json::to_value(&result.reasons)?)
        .bind(match_type)
        .bind(result.verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All unresolved edges above the probable threshold, newest first.
    pub async fn pending_groups(&self) -> Result<Vec<DuplicateEdgeRow>> {
        let rows = sqlx::query_as::<_, DuplicateEdgeRow>(
            r#"
            SELECT d.key_a, d.key_b, d.score, d.reasons, d.match_type, d.verified
            FROM trial_duplicates d
            JOIN clinical_trials ta ON ta.trial_key = d.key_a
            JOIN clinical_trials tb ON tb.trial_key = d.key_b
            WHERE ta.is_active = true AND tb.is_active = true
            ORDER BY d.score DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Merge a connected group of duplicate keys into one primary row,
    /// transactionally. Rolls back entirely on any step failure — partial
    /// merges are forbidden (§4.8).
    #[instrument(skip(self))]
    pub async fn merge_group(&self, keys: &[String]) -> Result<Option<String>> {
        if keys.len() < 2 {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let mut rows = Vec::new();
        for key in keys {
            let row = sqlx::query_as::<_, TrialRow>(
                r#"SELECT trial_key, external_ids, title_official, title_brief, title_lay,
                          description, conditions, interventions, phase, status, study_type,
                          primary_outcomes, secondary_outcomes, enrollment_target, enrollment_actual,
                          start_date, completion_date, last_update, first_posted, eligibility,
                          locations, contacts, sponsor, source, raw_data, is_active,
                          merged_into_key, duplicate_check_date
                   FROM clinical_trials WHERE trial_key = $1 AND is_active = true FOR UPDATE"#,
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                rows.push(row);
            }
        }

        if rows.len() < 2 {
            tx.rollback().await?;
            return Ok(None);
        }

        // Registry-priority rule, ties broken by most-recent last_update (§4.8).
        let primary = rows
            .iter()
            .min_by(|a, b| {
                a.source
                    .merge_priority()
                    .cmp(&b.source.merge_priority())
                    .then(b.last_update.cmp(&a.last_update))
            })
            .unwrap()
            .clone();

        let duplicates: Vec<&TrialRow> = rows.iter().filter(|r| r.trial_key != primary.trial_key).collect();

        // Fold every member of the group together in ascending-recency order
        // so §4.8's "array fields = union of all members; scalar fields =
        // value from whichever member last updated most recently, preferring
        // non-empty" rule applies across the whole group, not just
        // primary-vs-one-duplicate. Mirrors `trials::effects::MergedTrial::merge`'s
        // pairwise rule via the same `pick_scalar`/`pick_string` helpers.
        let mut ordered = rows.clone();
        ordered.sort_by_key(|r| r.last_update);
        let mut ordered = ordered.into_iter();
        let mut merged = MergedGroup::from_row(&ordered.next().expect("group has at least two rows"));
        for row in ordered {
            merged = merged.merge_row(&row);
        }

        sqlx::query(
            r#"
            UPDATE clinical_trials
            SET title_official = $2, title_brief = $3, title_lay = $4, description = $5,
                conditions = $6, interventions = $7, phase = $8, status = $9, study_type = $10,
                primary_outcomes = $11, secondary_outcomes = $12, enrollment_target = $13,
                enrollment_actual = $14, start_date = $15, completion_date = $16, last_update = $17,
                first_posted = $18, eligibility = $19, locations = $20, contacts = $21,
                sponsor = $22, external_ids = $23, updated_at = NOW()
            WHERE trial_key = $1
            "#,
        )
        .bind(&primary.trial_key)
        .bind(&merged.title_official)
        .bind(&merged.title_brief)
        .bind(&merged.title_lay)
        .bind(&merged.description)
        .bind(merged.conditions.iter().cloned().collect::<Vec<_>>())
        .bind(serde_json::to_value(&merged.interventions)?)
        .bind(merged.phase)
        .bind(merged.status)
        .bind(&merged.study_type)
        .bind(merged.primary_outcomes.iter().cloned().collect::<Vec<_>>())
        .bind(merged.secondary_outcomes.iter().cloned().collect::<Vec<_>>())
        .bind(merged.enrollment_target)
        .bind(merged.enrollment_actual)
        .bind(merged.start_date)
        .bind(merged.completion_date)
        .bind(merged.last_update)
        .bind(merged.first_posted)
        .bind(&merged.eligibility)
        .bind(serde_json::to_value(&merged.locations)?)
        .bind(serde_json::to_value(&merged.contacts)?)
        .bind(serde_json::to_value(&merged.sponsor)?)
        .bind(serde_json::to_value(&merged.external_ids)?)
        .execute(&mut *tx)
        .await?;

        for dup in &duplicates {
            sqlx::query(
                "UPDATE clinical_trials SET is_active = false, merged_into_key = $2, updated_at = NOW() WHERE trial_key = $1",
            )
            .bind(&dup.trial_key)
            .bind(&primary.trial_key)
            .execute(&mut *tx)
            .await?;

            // Re-point back-references (patient matches, saved lists) to the primary.
            sqlx::query("UPDATE trial_duplicates SET key_a = $2 WHERE key_a = $1")
                .bind(&dup.trial_key)
                .bind(&primary.trial_key)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE trial_duplicates SET key_b = $2 WHERE key_b = $1")
                .bind(&dup.trial_key)
                .bind(&primary.trial_key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(primary = %primary.trial_key, duplicates = duplicates.len(), "merged duplicate group");
        Ok(Some(primary.trial_key))
    }
}

/// Accumulates a §4.8 group merge across every member row: array fields
/// union as each row folds in, scalar fields take whichever row has been
/// seen most recently (by `last_update`) among rows processed so far,
/// preferring a non-empty value — the same rule `trials::effects::MergedTrial::merge`
/// applies pairwise during upsert, generalized here to an entire group by
/// folding members in ascending-recency order.
struct MergedGroup {
    title_official: String,
    title_brief: Option<String>,
    title_lay: Option<String>,
    description: Option<String>,
    conditions: HashSet<String>,
    interventions: Vec<Intervention>,
    phase: Phase,
    status: TrialStatus,
    study_type: Option<String>,
    primary_outcomes: HashSet<String>,
    secondary_outcomes: HashSet<String>,
    enrollment_target: Option<i32>,
    enrollment_actual: Option<i32>,
    start_date: Option<DateTime<Utc>>,
    completion_date: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    first_posted: Option<DateTime<Utc>>,
    eligibility: serde_json::Value,
    locations: Vec<TrialLocation>,
    contacts: Vec<TrialContact>,
    sponsor: Sponsor,
    external_ids: HashMap<String, String>,
}

impl MergedGroup {
    fn from_row(row: &TrialRow) -> Self {
        Self {
            title_official: row.title_official.clone(),
            title_brief: row.title_brief.clone(),
            title_lay: row.title_lay.clone(),
            description: row.description.clone(),
            conditions: row.conditions_set(),
            interventions: row.interventions_vec(),
            phase: row.phase,
            status: row.status,
            study_type: row.study_type.clone(),
            primary_outcomes: row.primary_outcomes.iter().cloned().collect(),
            secondary_outcomes: row.secondary_outcomes.iter().cloned().collect(),
            enrollment_target: row.enrollment_target,
            enrollment_actual: row.enrollment_actual,
            start_date: row.start_date,
            completion_date: row.completion_date,
            last_update: row.last_update,
            first_posted: row.first_posted,
            eligibility: row.eligibility.clone(),
            locations: row.locations(),
            contacts: row.contacts_vec(),
            sponsor: row.sponsor(),
            external_ids: row.external_ids_map(),
        }
    }

    fn merge_row(self, row: &TrialRow) -> Self {
        let incoming_is_newer = match (self.last_update, row.last_update) {
            (Some(old), Some(new)) => new >= old,
            (None, Some(_)) => true,
            _ => false,
        };

        let mut conditions = self.conditions;
        conditions.extend(row.conditions_set());

        let mut interventions = self.interventions;
        for i in row.interventions_vec() {
            if !interventions.iter().any(|e| e.name.eq_ignore_ascii_case(&i.name)) {
                interventions.push(i);
            }
        }

        let mut primary_outcomes = self.primary_outcomes;
        primary_outcomes.extend(row.primary_outcomes.iter().cloned());

        let mut secondary_outcomes = self.secondary_outcomes;
        secondary_outcomes.extend(row.secondary_outcomes.iter().cloned());

        let mut locations = self.locations;
        for l in row.locations() {
            if !locations.iter().any(|e| e.overlap_key() == l.overlap_key()) {
                locations.push(l);
            }
        }

        let mut contacts = self.contacts;
        for c in row.contacts_vec() {
            if !contacts.iter().any(|e| e.email.is_some() && e.email == c.email) {
                contacts.push(c);
            }
        }

        let row_sponsor = row.sponsor();
        let mut collaborators: HashSet<String> = self.sponsor.collaborators.into_iter().collect();
        collaborators.extend(row_sponsor.collaborators.iter().cloned());
        let sponsor = Sponsor {
            lead: if incoming_is_newer && row_sponsor.lead.is_some() {
                row_sponsor.lead.clone()
            } else {
                self.sponsor.lead.or(row_sponsor.lead)
            },
            collaborators: collaborators.into_iter().collect(),
        };

        let mut external_ids = self.external_ids;
        external_ids.extend(row.external_ids_map());

        Self {
            title_official: pick_string(&self.title_official, &row.title_official, incoming_is_newer),
            title_brief: pick_scalar(self.title_brief, row.title_brief.clone(), incoming_is_newer),
            title_lay: pick_scalar(self.title_lay, row.title_lay.clone(), incoming_is_newer),
            description: pick_scalar(self.description, row.description.clone(), incoming_is_newer),
            conditions,
            interventions,
            phase: if incoming_is_newer && row.phase != Phase::Na { row.phase } else { self.phase },
            status: if incoming_is_newer { row.status } else { self.status },
            study_type: pick_scalar(self.study_type, row.study_type.clone(), incoming_is_newer),
            primary_outcomes,
            secondary_outcomes,
            enrollment_target: pick_scalar(self.enrollment_target, row.enrollment_target, incoming_is_newer),
            enrollment_actual: pick_scalar(self.enrollment_actual, row.enrollment_actual, incoming_is_newer),
            start_date: pick_scalar(self.start_date, row.start_date, incoming_is_newer),
            completion_date: pick_scalar(self.completion_date, row.completion_date, incoming_is_newer),
            last_update: std::cmp::max(self.last_update, row.last_update),
            first_posted: self.first_posted.or(row.first_posted),
            eligibility: if incoming_is_newer { row.eligibility.clone() } else { self.eligibility },
            locations,
            contacts,
            sponsor,
            external_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_pair_is_stable_regardless_of_input_order() {
        assert_eq!(
            DedupRepository::ordered_pair("ctgov:nct01", "euctr:2020-001"),
            DedupRepository::ordered_pair("euctr:2020-001", "ctgov:nct01"),
        );
    }
}
