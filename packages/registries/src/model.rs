use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Canonical, registry-agnostic status vocabulary. Adapters map their
/// native status strings onto this set; anything unrecognized maps to
/// `Unknown` rather than failing normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trial_status", rename_all = "snake_case")]
pub enum TrialStatus {
    Recruiting,
    NotYetRecruiting,
    ActiveNotRecruiting,
    Completed,
    Suspended,
    Terminated,
    Withdrawn,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trial_phase", rename_all = "snake_case")]
pub enum Phase {
    EarlyPhase1,
    Phase1,
    Phase2,
    Phase2_3,
    Phase3,
    Phase4,
    Na,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "trial_gender", rename_all = "snake_case")]
pub enum Gender {
    #[default]
    All,
    Male,
    Female,
}

/// Registry tag. Used both as provenance (`CanonicalTrial::source`) and as
/// the merge-priority key in the deduplicator (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trial_source", rename_all = "snake_case")]
pub enum Registry {
    CtGov,
    EuCtr,
    Ctis,
    Isrctn,
    Ictrp,
}

impl Registry {
    /// ClinicalTrials.gov > EU CTR > CTIS > ISRCTN > WHO ICTRP, per §4.8.
    pub fn merge_priority(&self) -> u8 {
        match self {
            Registry::CtGov => 0,
            Registry::EuCtr => 1,
            Registry::Ctis => 2,
            Registry::Isrctn => 3,
            Registry::Ictrp => 4,
        }
    }

    pub fn as_external_id_key(&self) -> &'static str {
        match self {
            Registry::CtGov => "nct",
            Registry::EuCtr => "eudract",
            Registry::Ctis => "ctis",
            Registry::Isrctn => "isrctn",
            Registry::Ictrp => "ictrp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervention {
    pub kind: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLocation {
    pub facility: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub status: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TrialLocation {
    /// Key used for the Jaccard location-overlap term in §4.8's similarity
    /// score: "facility-city-country".
    pub fn overlap_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.facility.as_deref().unwrap_or(""),
            self.city.as_deref().unwrap_or(""),
            self.country.as_deref().unwrap_or("")
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Sponsor {
    pub lead: Option<String>,
    pub collaborators: Vec<String>,
}

/// Age bound normalized to a day-count, with the adapter's original
/// free-text preserved for audit (§4.5 "Age mapping").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBound {
    pub days: i64,
    pub original: String,
}

/// Fixed age-group → day-count table shared by the EU CTR/CTIS adapters,
/// per §4.5.
pub fn age_group_to_days(group: &str) -> Option<i64> {
    match group.to_lowercase().as_str() {
        "newborn" | "newborns" => Some(0),
        "infant" | "infants" => Some(28),
        "child" | "children" => Some(2 * 365),
        "adolescent" | "adolescents" => Some(12 * 365),
        "adult" | "adults" => Some(18 * 365),
        "elderly" | "older_adult" | "older_adults" => Some(65 * 365),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eligibility {
    pub inclusion_text: Option<String>,
    pub exclusion_text: Option<String>,
    pub gender: Gender,
    pub min_age: Option<AgeBound>,
    pub max_age: Option<AgeBound>,
}

/// The normalized record every adapter's `normalize` produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTrial {
    /// Primary key, conventionally `{source}:{native_id}`.
    pub trial_key: String,
    pub external_ids: HashMap<String, String>,

    pub title_official: String,
    pub title_brief: Option<String>,
    pub title_lay: Option<String>,
    pub description: Option<String>,
    pub conditions: HashSet<String>,
    pub interventions: Vec<Intervention>,
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

    pub eligibility: Eligibility,
    pub locations: Vec<TrialLocation>,
    pub contacts: Vec<TrialContact>,
    pub sponsor: Sponsor,

    pub source: Registry,
    pub raw_data: serde_json::Value,
}

impl CanonicalTrial {
    /// Derives the text embedded for the matcher's vector search (§4.9)
    /// and hashed for `TrialEmbedding::source_text_hash` staleness checks.
    pub fn embedding_source_text(&self) -> String {
        let conditions = self.conditions.iter().cloned().collect::<Vec<_>>().join(", ");
        let interventions = self
            .interventions
            .iter()
            .map(|i| i.name.clone())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_priority_orders_ctgov_first() {
        assert!(Registry::CtGov.merge_priority() < Registry::EuCtr.merge_priority());
        assert!(Registry::EuCtr.merge_priority() < Registry::Ctis.merge_priority());
        assert!(Registry::Ctis.merge_priority() < Registry::Isrctn.merge_priority());
        assert!(Registry::Isrctn.merge_priority() < Registry::Ictrp.merge_priority());
    }

    #[test]
    fn age_group_table_matches_fixed_mapping() {
        assert_eq!(age_group_to_days("newborn"), Some(0));
        assert_eq!(age_group_to_days("infants"), Some(28));
        assert_eq!(age_group_to_days("children"), Some(2 * 365));
        assert_eq!(age_group_to_days("adolescents"), Some(12 * 365));
        assert_eq!(age_group_to_days("adults"), Some(18 * 365));
        assert_eq!(age_group_to_days("elderly"), Some(65 * 365));
        assert_eq!(age_group_to_days("made-up"), None);
    }

    #[test]
    fn location_overlap_key_is_lowercase_and_stable() {
        let loc = TrialLocation {
            facility: Some("Mayo Clinic".into()),
            city: Some("Rochester".into()),
            state: Some("MN".into()),
            country: Some("USA".into()),
            status: None,
            latitude: None,
            longitude: None,
        };
        assert_eq!(loc.overlap_key(), "mayo clinic-rochester-usa");
    }
}
