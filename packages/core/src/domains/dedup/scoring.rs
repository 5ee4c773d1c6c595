//! Pure similarity scoring for the deduplicator (§4.8). No side effects, no
//! database access — written in the style of
//! `domains::matching::utils::relevance::check_relevance_by_similarity`:
//! named threshold constants, a pure function, and a dense boundary-value
//! test suite.

use std::collections::HashSet;

use registries::CanonicalTrial;

pub const WEIGHT_TITLE: f64 = 0.35;
pub const WEIGHT_SPONSOR: f64 = 0.20;
pub const WEIGHT_DATE: f64 = 0.10;
pub const WEIGHT_LOCATION: f64 = 0.10;
pub const WEIGHT_CONDITION: f64 = 0.15;
pub const WEIGHT_INTERVENTION: f64 = 0.10;

pub const EDGE_THRESHOLD: f64 = 0.85;
pub const EXACT_THRESHOLD: f64 = 0.95;
pub const FUZZY_THRESHOLD: f64 = 0.90;
pub const PROBABLE_THRESHOLD: f64 = 0.85;

pub const DATE_PROXIMITY_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "duplicate_match_type", rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Probable,
}

/// `score` is the weighted sum in `[0, 1]`; `verified` is true only for the
/// NCT-id short circuit.
#[derive(Debug, Clone)]
pub struct SimilarityResult {
    pub score: f64,
    pub match_type: Option<MatchType>,
    pub verified: bool,
    pub reasons: Vec<String>,
}

fn trigrams(s: &str) -> HashSet<String> {
    let normalized: String = s.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() < 3 {
        return HashSet::from([normalized]);
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Character-trigram Jaccard similarity, approximating Postgres's
/// `pg_trgm` `similarity()` used for the database-index nearest-neighbor
/// pass (§4.8 detection pass (b)).
pub fn title_trigram_similarity(a: &str, b: &str) -> f64 {
    jaccard(&trigrams(a), &trigrams(b))
}

fn location_overlap(a: &CanonicalTrial, b: &CanonicalTrial) -> f64 {
    let a_keys: HashSet<String> = a.locations.iter().map(|l| l.overlap_key()).collect();
    let b_keys: HashSet<String> = b.locations.iter().map(|l| l.overlap_key()).collect();
    jaccard(&a_keys, &b_keys)
}

fn condition_overlap(a: &CanonicalTrial, b: &CanonicalTrial) -> f64 {
    let a_set: HashSet<String> = a.conditions.iter().map(|c| c.to_lowercase()).collect();
    let b_set: HashSet<String> = b.conditions.iter().map(|c| c.to_lowercase()).collect();
    jaccard(&a_set, &b_set)
}

fn intervention_overlap(a: &CanonicalTrial, b: &CanonicalTrial) -> f64 {
    let a_set: HashSet<String> = a.interventions.iter().map(|i| i.name.to_lowercase()).collect();
    let b_set: HashSet<String> = b.interventions.iter().map(|i| i.name.to_lowercase()).collect();
    jaccard(&a_set, &b_set)
}

fn date_proximity(a: &CanonicalTrial, b: &CanonicalTrial) -> f64 {
    match (a.start_date, b.start_date) {
        (Some(x), Some(y)) => {
            let delta = (x - y).num_days().abs();
            if delta <= DATE_PROXIMITY_DAYS {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn sponsor_exact_match(a: &CanonicalTrial, b: &CanonicalTrial) -> f64 {
    match (&a.sponsor.lead, &b.sponsor.lead) {
        (Some(x), Some(y)) if x.trim().eq_ignore_ascii_case(y.trim()) && !x.trim().is_empty() => 1.0,
        _ => 0.0,
    }
}

/// A trial lists the other's NCT id in its `external_ids`, or both share
/// the same non-empty NCT id — §4.8's exact short-circuit.
pub fn nct_overlap(a: &CanonicalTrial, b: &CanonicalTrial) -> bool {
    let a_nct = a.external_ids.get("nct");
    let b_nct = b.external_ids.get("nct");
    match (a_nct, b_nct) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub fn classify(score: f64) -> Option<MatchType> {
    if score >= EXACT_THRESHOLD {
        Some(MatchType::Exact)
    } else if score >= FUZZY_THRESHOLD {
        Some(MatchType::Fuzzy)
    } else if score >= PROBABLE_THRESHOLD {
        Some(MatchType::Probable)
    } else {
        None
    }
}

/// Symmetric by construction: every term is a Jaccard/equality/threshold
/// comparison over the unordered pair (§8 "dedup symmetry").
pub fn similarity(a: &CanonicalTrial, b: &CanonicalTrial) -> SimilarityResult {
    if nct_overlap(a, b) {
        return SimilarityResult {
            score: 1.0,
            match_type: Some(MatchType::Exact),
            verified: true,
            reasons: vec!["matching NCT id in external_ids".to_string()],
        };
    }

    let title = title_trigram_similarity(&a.title_official, &b.title_official);
    let sponsor = sponsor_exact_match(a, b);
    let date = date_proximity(a, b);
    let location = location_overlap(a, b);
    let condition = condition_overlap(a, b);
    let intervention = intervention_overlap(a, b);

    let score = title * WEIGHT_TITLE
        + sponsor * WEIGHT_SPONSOR
        + date * WEIGHT_DATE
        + location * WEIGHT_LOCATION
        + condition * WEIGHT_CONDITION
        + intervention * WEIGHT_INTERVENTION;

    let mut reasons = Vec::new();
    if title > 0.5 {
        reasons.push(format!("title similarity {:.2}", title));
    }
    if sponsor == 1.0 {
        reasons.push("sponsor exact match".to_string());
    }
    if condition > 0.0 {
        reasons.push(format!("condition overlap {:.2}", condition));
    }

    SimilarityResult {
        score,
        match_type: classify(score),
        verified: false,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use registries::{Eligibility, Gender, Intervention, Phase, Registry, Sponsor, TrialLocation, TrialStatus};
    use std::collections::{HashMap, HashSet as StdHashSet};

    fn trial(key: &str, title: &str, sponsor: Option<&str>) -> CanonicalTrial {
        CanonicalTrial {
            trial_key: key.into(),
            external_ids: HashMap::new(),
            title_official: title.into(),
            title_brief: None,
            title_lay: None,
            description: None,
            conditions: StdHashSet::from(["diabetes".to_string()]),
            interventions: vec![Intervention {
                kind: "Drug".into(),
                name: "Metformin".into(),
                description: None,
            }],
            phase: Phase::Phase2,
            status: TrialStatus::Recruiting,
            study_type: None,
            primary_outcomes: vec![],
            secondary_outcomes: vec![],
            enrollment_target: None,
            enrollment_actual: None,
            start_date: Some(Utc::now()),
            completion_date: None,
            last_update: None,
            first_posted: None,
            eligibility: Eligibility {
                inclusion_text: None,
                exclusion_text: None,
                gender: Gender::All,
                min_age: None,
                max_age: None,
            },
            locations: vec![TrialLocation {
                facility: Some("Mayo Clinic".into()),
                city: Some("Rochester".into()),
                state: None,
                country: Some("USA".into()),
                status: None,
                latitude: None,
                longitude: None,
            }],
            contacts: vec![],
            sponsor: Sponsor {
                lead: sponsor.map(|s| s.to_string()),
                collaborators: vec![],
            },
            source: Registry::CtGov,
            raw_data: serde_json::json!({}),
        }
    }

    #[test]
    fn nct_overlap_short_circuits_to_exact_verified() {
        let mut a = trial("a", "Metformin Study", Some("Acme"));
        let mut b = trial("b", "A totally different title", None);
        a.external_ids.insert("nct".into(), "NCT01".into());
        b.external_ids.insert("nct".into(), "NCT01".into());
        let result = similarity(&a, &b);
        assert_eq!(result.score, 1.0);
        assert!(result.verified);
        assert_eq!(result.match_type, Some(MatchType::Exact));
    }

    #[test]
    fn identical_trials_score_above_edge_threshold() {
        let a = trial("a", "Metformin in T2D", Some("Acme"));
        let b = trial("b", "Metformin in T2D", Some("Acme"));
        let result = similarity(&a, &b);
        assert!(result.score >= EDGE_THRESHOLD);
    }

    #[test]
    fn unrelated_trials_score_below_edge_threshold() {
        let a = trial("a", "Metformin in T2D", Some("Acme"));
        let b = trial("b", "Surgical outcomes in hip replacement", Some("Other Org"));
        let mut b = b;
        b.conditions = StdHashSet::from(["hip fracture".to_string()]);
        b.interventions = vec![Intervention {
            kind: "Procedure".into(),
            name: "Arthroplasty".into(),
            description: None,
        }];
        b.locations = vec![];
        b.start_date = None;
        let result = similarity(&a, &b);
        assert!(result.score < EDGE_THRESHOLD);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = trial("a", "Metformin in T2D", Some("Acme"));
        let b = trial("b", "Metformin for type-2 diabetes", Some("Acme"));
        let ab = similarity(&a, &b).score;
        let ba = similarity(&b, &a).score;
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn classify_respects_threshold_boundaries() {
        assert_eq!(classify(0.95), Some(MatchType::Exact));
        assert_eq!(classify(0.90), Some(MatchType::Fuzzy));
        assert_eq!(classify(0.85), Some(MatchType::Probable));
        assert_eq!(classify(0.84), None);
    }
}
