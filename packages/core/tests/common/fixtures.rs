use std::collections::{HashMap, HashSet};

use chrono::Utc;
use registries::{CanonicalTrial, Eligibility, Gender, Phase, Registry, Sponsor, TrialStatus};

/// Minimal, valid `CanonicalTrial` for a given `trial_key`/`source`, with
/// everything else defaulted to the emptiest value that still round-trips
/// through `TrialRepository::upsert`.
pub fn canonical_trial(trial_key: &str, source: Registry, title: &str) -> CanonicalTrial {
    CanonicalTrial {
        trial_key: trial_key.to_string(),
        external_ids: HashMap::new(),
        title_official: title.to_string(),
        title_brief: None,
        title_lay: None,
        description: Some("a trial".to_string()),
        conditions: HashSet::from(["diabetes".to_string()]),
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
            gender: Gender::All,
            min_age: None,
            max_age: None,
        },
        locations: vec![],
        contacts: vec![],
        sponsor: Sponsor::default(),
        source,
        raw_data: serde_json::json!({}),
    }
}
