//! Pure scoring functions for the matcher (§4.9), written in the
//! threshold-constant-and-pure-function style of
//! `domains::matching::utils::relevance::check_relevance_by_similarity`.

use registries::{AgeBound, Eligibility, Gender};
use serde::{Deserialize, Serialize};

pub const WEIGHT_VECTOR: f64 = 0.4;
pub const WEIGHT_KEYWORD: f64 = 0.3;
pub const WEIGHT_ELIGIBILITY: f64 = 0.2;
pub const WEIGHT_LOCATION: f64 = 0.1;

pub const VECTOR_SIMILARITY_FLOOR: f64 = 0.6;
pub const CANDIDATE_MULTIPLIER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct PatientLocation {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

/// Patient inputs to the matcher (§4.9 "Inputs").
#[derive(Debug, Clone)]
pub struct PatientProfile {
    pub conditions: Vec<String>,
    pub symptoms: Vec<String>,
    pub age_days: Option<i64>,
    pub gender: Option<Gender>,
    pub prior_treatments: Vec<String>,
    pub medications: Vec<String>,
    /// Collected but intentionally unused in scoring, reserved for future
    /// policy (§9 open question).
    pub urgency: Urgency,
    pub location: PatientLocation,
}

impl PatientProfile {
    /// §4.9.1's fixed template, with empty clauses omitted.
    pub fn canonical_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.conditions.is_empty() {
            parts.push(format!("Conditions: {}.", self.conditions.join(", ")));
        }
        if !self.symptoms.is_empty() {
            parts.push(format!("Symptoms: {}.", self.symptoms.join(", ")));
        }
        if !self.prior_treatments.is_empty() {
            parts.push(format!("Previous treatments: {}.", self.prior_treatments.join(", ")));
        }
        if !self.medications.is_empty() {
            parts.push(format!("Current medications: {}.", self.medications.join(", ")));
        }
        if let Some(age_days) = self.age_days {
            parts.push(format!("Age: {} years.", age_days / 365));
        }
        if let Some(gender) = self.gender {
            parts.push(format!("Gender: {}.", gender_label(gender)));
        }
        parts.push(format!("Treatment urgency: {}.", urgency_label(self.urgency)));
        let location = [&self.location.city, &self.location.state, &self.location.country]
            .iter()
            .filter_map(|v| v.as_deref())
            .collect::<Vec<_>>()
            .join(", ");
        if !location.is_empty() {
            parts.push(format!("Location: {}.", location));
        }
        parts.join(" ")
    }
}

fn gender_label(gender: Gender) -> &'static str {
    match gender {
        Gender::All => "any",
        Gender::Male => "male",
        Gender::Female => "female",
    }
}

fn urgency_label(urgency: Urgency) -> &'static str {
    match urgency {
        Urgency::Low => "low",
        Urgency::Medium => "medium",
        Urgency::High => "high",
    }
}

/// §4.9 step 5: drop candidates whose eligibility excludes the patient.
/// Absence of an age bound or a gender restriction never excludes.
pub fn is_eligible(eligibility: &Eligibility, patient_age_days: Option<i64>, patient_gender: Option<Gender>) -> bool {
    if let Some(age) = patient_age_days {
        if let Some(AgeBound { days, .. }) = &eligibility.min_age {
            if age < *days {
                return false;
            }
        }
        if let Some(AgeBound { days, .. }) = &eligibility.max_age {
            if age > *days {
                return false;
            }
        }
    }
    if let (Some(patient_gender), trial_gender) = (patient_gender, eligibility.gender) {
        if trial_gender != Gender::All && trial_gender != patient_gender {
            return false;
        }
    }
    true
}

/// §4.9 step 6: 0.5 country + 0.3 state + 0.2 city, capped at 1.0; 0.5 if
/// the patient has no location at all.
pub fn location_score(patient: &PatientLocation, trial_locations: &[registries::TrialLocation]) -> f64 {
    if patient.city.is_none() && patient.state.is_none() && patient.country.is_none() {
        return 0.5;
    }

    let mut best = 0.0f64;
    for loc in trial_locations {
        let mut score = 0.0;
        if matches_ci(&patient.country, &loc.country) {
            score += 0.5;
        }
        if matches_ci(&patient.state, &loc.state) {
            score += 0.3;
        }
        if matches_ci(&patient.city, &loc.city) {
            score += 0.2;
        }
        best = best.max(score);
    }
    best.min(1.0)
}

fn matches_ci(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()) && !a.trim().is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct ScoredTrial {
    pub trial_key: String,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub eligibility_score: f64,
    pub location_score: f64,
    pub final_score: f64,
    pub explanation: String,
}

/// §4.9 step 7's weighted sum, plus an auto-generated explanation naming
/// which components contributed.
pub fn final_score(trial_key: &str, vector: f64, keyword_rank_norm: f64, eligibility: f64, location: f64) -> ScoredTrial {
    let score = vector * WEIGHT_VECTOR
        + keyword_rank_norm * WEIGHT_KEYWORD
        + eligibility * WEIGHT_ELIGIBILITY
        + location * WEIGHT_LOCATION;

    let mut contributions = Vec::new();
    if vector > 0.0 {
        contributions.push(format!("semantic similarity {:.0}%", vector * 100.0));
    }
    if keyword_rank_norm > 0.0 {
        contributions.push(format!("keyword match {:.0}%", keyword_rank_norm * 100.0));
    }
    if eligibility > 0.0 {
        contributions.push("eligibility criteria satisfied".to_string());
    }
    if location > 0.5 {
        contributions.push("nearby location".to_string());
    }
    let explanation = if contributions.is_empty() {
        "Weak match on all criteria".to_string()
    } else {
        format!("Matched on: {}", contributions.join(", "))
    };

    ScoredTrial {
        trial_key: trial_key.to_string(),
        vector_score: vector,
        keyword_score: keyword_rank_norm,
        eligibility_score: eligibility,
        location_score: location,
        final_score: score,
        explanation,
    }
}

/// Tie-break on equal final score by `trial_key` lexicographic ascending
/// (§4.9 "Determinism").
pub fn rank(mut scored: Vec<ScoredTrial>) -> Vec<ScoredTrial> {
    scored.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.trial_key.cmp(&b.trial_key))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use registries::TrialLocation;

    #[test]
    fn canonical_text_omits_empty_clauses() {
        let profile = PatientProfile {
            conditions: vec!["diabetes".to_string()],
            symptoms: vec![],
            age_days: Some(30 * 365),
            gender: Some(Gender::Female),
            prior_treatments: vec![],
            medications: vec![],
            urgency: Urgency::Medium,
            location: PatientLocation::default(),
        };
        let text = profile.canonical_text();
        assert!(text.contains("Conditions: diabetes."));
        assert!(!text.contains("Symptoms:"));
        assert!(text.contains("Age: 30 years."));
        assert!(text.contains("Gender: female."));
        assert!(!text.contains("Location:"));
    }

    #[test]
    fn age_gate_excludes_trial_outside_bounds() {
        let eligibility = Eligibility {
            inclusion_text: None,
            exclusion_text: None,
            gender: Gender::All,
            min_age: Some(AgeBound { days: 18 * 365, original: "18 years".into() }),
            max_age: Some(AgeBound { days: 65 * 365, original: "65 years".into() }),
        };
        assert!(!is_eligible(&eligibility, Some(10 * 365), None));
        assert!(is_eligible(&eligibility, Some(30 * 365), None));
    }

    #[test]
    fn gender_restriction_excludes_incompatible_patient() {
        let eligibility = Eligibility {
            inclusion_text: None,
            exclusion_text: None,
            gender: Gender::Male,
            min_age: None,
            max_age: None,
        };
        assert!(!is_eligible(&eligibility, None, Some(Gender::Female)));
        assert!(is_eligible(&eligibility, None, Some(Gender::Male)));
    }

    #[test]
    fn location_score_with_no_patient_location_is_half() {
        let patient = PatientLocation::default();
        let trial_locs = vec![TrialLocation {
            facility: None,
            city: Some("Rochester".into()),
            state: Some("MN".into()),
            country: Some("USA".into()),
            status: None,
            latitude: None,
            longitude: None,
        }];
        assert_eq!(location_score(&patient, &trial_locs), 0.5);
    }

    #[test]
    fn location_score_caps_at_one_for_full_match() {
        let patient = PatientLocation {
            city: Some("Rochester".into()),
            state: Some("MN".into()),
            country: Some("USA".into()),
        };
        let trial_locs = vec![TrialLocation {
            facility: None,
            city: Some("Rochester".into()),
            state: Some("MN".into()),
            country: Some("USA".into()),
            status: None,
            latitude: None,
            longitude: None,
        }];
        assert_eq!(location_score(&patient, &trial_locs), 1.0);
    }

    #[test]
    fn rank_breaks_ties_by_trial_key_ascending() {
        let scored = vec![
            final_score("b", 0.5, 0.5, 1.0, 0.5),
            final_score("a", 0.5, 0.5, 1.0, 0.5),
        ];
        let ranked = rank(scored);
        assert_eq!(ranked[0].trial_key, "a");
    }
}
