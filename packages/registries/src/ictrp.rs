//! WHO International Clinical Trials Registry Platform adapter. Bulk
//! ZIP+XML file drop (§4.5), same shape as [`crate::euctr`].
//!
//! ICTRP aggregates records from dozens of primary registries; its export
//! already carries a `source_register` field per record, which is folded
//! into `external_ids` alongside the ICTRP id itself.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::adapter::{BulkDropDirectory, Cursor, EnumeratePage, RawRecord, RegistryAdapter};
use crate::error::{NormalizationError, RegistryError};
use crate::euctr::{extract_single_xml, latest_file_with_prefix};
use crate::model::{
    CanonicalTrial, Eligibility, Gender, Intervention, Phase, Registry, Sponsor, TrialContact,
    TrialLocation, TrialStatus,
};
use crate::normalize::{map_status, parse_age, parse_phase, split_list};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

const BATCH_SIZE: usize = 100;
const FILE_GLOB_PREFIX: &str = "ictrp_export_";

#[derive(Debug, Deserialize)]
struct IctrpExport {
    #[serde(rename = "record", default)]
    records: Vec<IctrpRecord>,
}

#[derive(Debug, Deserialize, Clone)]
struct IctrpRecord {
    trial_id: String,
    #[serde(default)]
    source_register: Option<String>,
    #[serde(default)]
    secondary_ids: Option<String>,
    #[serde(default)]
    public_title: Option<String>,
    #[serde(default)]
    scientific_title: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    intervention: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    recruitment_status: Option<String>,
    #[serde(default)]
    study_type: Option<String>,
    #[serde(default)]
    countries: Option<String>,
    #[serde(default)]
    inclusion_criteria: Option<String>,
    #[serde(default)]
    exclusion_criteria: Option<String>,
    #[serde(default)]
    agemin: Option<String>,
    #[serde(default)]
    agemax: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    target_size: Option<String>,
    #[serde(default)]
    primary_sponsor: Option<String>,
    #[serde(default)]
    secondary_sponsors: Option<String>,
    #[serde(default)]
    date_registration: Option<String>,
    #[serde(default)]
    date_enrollment: Option<String>,
    #[serde(default)]
    last_refreshed: Option<String>,
}

pub struct IctrpAdapter {
    drop_dir: BulkDropDirectory,
}

impl IctrpAdapter {
    pub fn new(drop_dir: BulkDropDirectory) -> Self {
        Self { drop_dir }
    }

    fn latest_export_file(&self) -> Option<PathBuf> {
        latest_file_with_prefix(&self.drop_dir.path, FILE_GLOB_PREFIX, "zip")
    }

    fn load_export(path: &std::path::Path) -> Result<IctrpExport, RegistryError> {
        let xml = extract_single_xml(path, "ictrp")?;
        quick_xml::de::from_str(&xml).map_err(|e| RegistryError::MalformedArchive {
            registry: "ictrp".into(),
            reason: format!("XML parse error: {e}"),
        })
    }

    fn parse_date(s: &Option<String>) -> Option<DateTime<Utc>> {
        let s = s.as_ref()?;
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
            .ok()
            .map(|d| DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc))
    }
}

#[async_trait]
impl RegistryAdapter for IctrpAdapter {
    fn registry(&self) -> Registry {
        Registry::Ictrp
    }

    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError> {
        let path = self
            .latest_export_file()
            .ok_or_else(|| RegistryError::ManualImportRequired {
                registry: "ictrp".into(),
                expected_path: self.drop_dir.path.display().to_string(),
            })?;

        let (file_name, offset) = match cursor {
            Some(Cursor::BulkFile {
                file_name,
                record_offset,
            }) => (file_name, record_offset as usize),
            Some(_) => {
                return Err(RegistryError::MalformedArchive {
                    registry: "ictrp".into(),
                    reason: "expected a BulkFile cursor".into(),
                })
            }
            None => (
                path.file_name().unwrap().to_string_lossy().to_string(),
                0usize,
            ),
        };

        let export = Self::load_export(&path)?;
        let total = export.records.len();
        let batch: Vec<_> = export
            .records
            .into_iter()
            .skip(offset)
            .take(BATCH_SIZE)
            .collect();

        let records = batch
            .into_iter()
            .map(|r| {
                let native_id = r.trial_id.clone();
                let raw = serde_json::to_value(&r).unwrap_or(Value::Null);
                RawRecord { native_id, raw }
            })
            .collect::<Vec<_>>();

        let next_offset = offset + records.len();
        let next_cursor = if next_offset >= total {
            None
        } else {
            Some(Cursor::BulkFile {
                file_name,
                record_offset: next_offset as u64,
            })
        };

        Ok(EnumeratePage {
            records,
            next_cursor,
            total_estimate: Some(total as u64),
        })
    }

    async fn fetch(&self, native_id: &str) -> Result<RawRecord, RegistryError> {
        let path = self
            .latest_export_file()
            .ok_or_else(|| RegistryError::ManualImportRequired {
                registry: "ictrp".into(),
                expected_path: self.drop_dir.path.display().to_string(),
            })?;
        let export = Self::load_export(&path)?;
        export
            .records
            .into_iter()
            .find(|r| r.trial_id == native_id)
            .map(|r| RawRecord {
                native_id: native_id.to_string(),
                raw: serde_json::to_value(&r).unwrap_or(Value::Null),
            })
            .ok_or_else(|| RegistryError::MalformedArchive {
                registry: "ictrp".into(),
                reason: format!("no record {native_id} in current export"),
            })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError> {
        let r: IctrpRecord =
            serde_json::from_value(raw.raw.clone()).map_err(|e| NormalizationError::Failed {
                field: "<root>".into(),
                raw: e.to_string(),
            })?;

        let mut external_ids = HashMap::new();
        external_ids.insert("ictrp".to_string(), r.trial_id.clone());
        if let Some(register) = &r.source_register {
            if let Some(ids) = &r.secondary_ids {
                for (i, id) in split_list(ids, ';').into_iter().enumerate() {
                    let key = if i == 0 {
                        register.to_lowercase()
                    } else {
                        format!("{}_{i}", register.to_lowercase())
                    };
                    external_ids.insert(key, id);
                }
            }
        }

        let conditions = r
            .condition
            .as_deref()
            .map(|s| split_list(s, ';').into_iter().collect())
            .unwrap_or_default();

        let interventions = r
            .intervention
            .as_deref()
            .map(|s| {
                split_list(s, ';')
                    .into_iter()
                    .map(|name| Intervention {
                        kind: "Unspecified".to_string(),
                        name,
                        description: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let locations = r
            .countries
            .as_deref()
            .map(|s| {
                split_list(s, ';')
                    .into_iter()
                    .map(|country| TrialLocation {
                        facility: None,
                        city: None,
                        state: None,
                        country: Some(country),
                        status: None,
                        latitude: None,
                        longitude: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let gender = match r.gender.as_deref() {
            Some("Male") => Gender::Male,
            Some("Female") => Gender::Female,
            _ => Gender::All,
        };

        Ok(CanonicalTrial {
            trial_key: self.trial_key(&r.trial_id),
            external_ids,
            title_official: r
                .scientific_title
                .clone()
                .or_else(|| r.public_title.clone())
                .unwrap_or_default(),
            title_brief: r.public_title.clone(),
            title_lay: None,
            description: None,
            conditions,
            interventions,
            phase: r.phase.as_deref().map(parse_phase).unwrap_or(Phase::Na),
            status: r
                .recruitment_status
                .as_deref()
                .map(map_status)
                .unwrap_or(TrialStatus::Unknown),
            study_type: r.study_type.clone(),
            primary_outcomes: Vec::new(),
            secondary_outcomes: Vec::new(),
            enrollment_target: r.target_size.as_deref().and_then(|s| s.parse().ok()),
            enrollment_actual: None,
            start_date: Self::parse_date(&r.date_enrollment),
            completion_date: None,
            last_update: Self::parse_date(&r.last_refreshed),
            first_posted: Self::parse_date(&r.date_registration),
            eligibility: Eligibility {
                inclusion_text: r.inclusion_criteria.clone(),
                exclusion_text: r.exclusion_criteria.clone(),
                gender,
                min_age: r.agemin.as_deref().and_then(parse_age),
                max_age: r.agemax.as_deref().and_then(parse_age),
            },
            locations,
            contacts: Vec::<TrialContact>::new(),
            sponsor: Sponsor {
                lead: r.primary_sponsor.clone(),
                collaborators: r
                    .secondary_sponsors
                    .as_deref()
                    .map(|s| split_list(s, ';'))
                    .unwrap_or_default(),
            },
            source: Registry::Ictrp,
            raw_data: raw.raw.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> IctrpAdapter {
        IctrpAdapter::new(BulkDropDirectory::new(std::env::temp_dir()))
    }

    #[test]
    fn normalizes_minimal_record_into_canonical_trial() {
        let raw = RawRecord {
            native_id: "U1111-1111-1111".into(),
            raw: json!({
                "trial_id": "U1111-1111-1111",
                "source_register": "ChiCTR",
                "secondary_ids": "ChiCTR2100000001",
                "public_title": "A study of something",
                "condition": "Hypertension;Diabetes",
                "recruitment_status": "Recruiting",
                "countries": "China",
                "gender": "All",
            }),
        };
        let trial = adapter().normalize(&raw).unwrap();
        assert_eq!(trial.external_ids.get("ictrp").unwrap(), "U1111-1111-1111");
        assert_eq!(trial.external_ids.get("chictr").unwrap(), "ChiCTR2100000001");
        assert_eq!(trial.conditions.len(), 2);
        assert_eq!(trial.status, TrialStatus::Recruiting);
    }

    #[test]
    fn missing_trial_id_is_a_normalization_error() {
        let raw = RawRecord {
            native_id: "x".into(),
            raw: json!({"public_title": "No id here"}),
        };
        assert!(adapter().normalize(&raw).is_err());
    }
}
