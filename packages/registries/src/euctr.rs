//! EU Clinical Trials Register adapter. Bulk ZIP+XML file drop (§4.5).
//!
//! EU CTR has no enumeration API; an operator periodically drops a ZIP
//! export into [`BulkDropDirectory`]. Cadence is operator-driven (§9 open
//! question, left unresolved by design).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::adapter::{BulkDropDirectory, Cursor, EnumeratePage, RawRecord, RegistryAdapter};
use crate::error::{NormalizationError, RegistryError};
use crate::model::{
    age_group_to_days, AgeBound, CanonicalTrial, Eligibility, Gender, Intervention, Phase,
    Registry, Sponsor, TrialContact, TrialLocation, TrialStatus,
};
use crate::normalize::{map_status, parse_phase, split_list};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

const BATCH_SIZE: usize = 100;
const FILE_GLOB_PREFIX: &str = "euctr_export_";

#[derive(Debug, Deserialize)]
struct EuctrExport {
    #[serde(rename = "trial", default)]
    trials: Vec<EuctrTrial>,
}

#[derive(Debug, Deserialize, Clone)]
struct EuctrTrial {
    eudract_number: String,
    #[serde(default)]
    sponsor_protocol_number: Option<String>,
    #[serde(default)]
    nct_number: Option<String>,
    #[serde(default)]
    full_title: Option<String>,
    #[serde(default)]
    public_title: Option<String>,
    #[serde(default)]
    medical_condition: Option<String>,
    #[serde(default)]
    products: Option<String>,
    #[serde(default)]
    trial_phase: Option<String>,
    #[serde(default)]
    trial_status: Option<String>,
    #[serde(default)]
    member_states_concerned: Option<String>,
    #[serde(default)]
    age_range: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    sponsor_name: Option<String>,
    #[serde(default)]
    date_of_competent_authority_decision: Option<String>,
    #[serde(default)]
    global_end_of_trial_date: Option<String>,
}

pub struct EuCtrAdapter {
    drop_dir: BulkDropDirectory,
}

impl EuCtrAdapter {
    pub fn new(drop_dir: BulkDropDirectory) -> Self {
        Self { drop_dir }
    }

    fn latest_export_file(&self) -> Option<PathBuf> {
        latest_file_with_prefix(&self.drop_dir.path, FILE_GLOB_PREFIX, "zip")
    }

    fn load_export(path: &Path) -> Result<EuctrExport, RegistryError> {
        let xml = extract_single_xml(path, "euctr")?;
        quick_xml::de::from_str(&xml).map_err(|e| RegistryError::MalformedArchive {
            registry: "euctr".into(),
            reason: format!("XML parse error: {e}"),
        })
    }

    fn parse_date(s: &Option<String>) -> Option<DateTime<Utc>> {
        let s = s.as_ref()?;
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .map(|d| DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc))
    }

    fn age_bound(range: &Option<String>, pick_min: bool) -> Option<AgeBound> {
        let range = range.as_ref()?;
        let parts: Vec<&str> = range.split('-').map(|s| s.trim()).collect();
        let group = if pick_min { parts.first() } else { parts.last() }?;
        let days = age_group_to_days(group)?;
        Some(AgeBound {
            days,
            original: (*group).to_string(),
        })
    }
}

#[async_trait]
impl RegistryAdapter for EuCtrAdapter {
    fn registry(&self) -> Registry {
        Registry::EuCtr
    }

    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError> {
        let path = self
            .latest_export_file()
            .ok_or_else(|| RegistryError::ManualImportRequired {
                registry: "euctr".into(),
                expected_path: self.drop_dir.path.display().to_string(),
            })?;

        let (file_name, offset) = match cursor {
            Some(Cursor::BulkFile {
                file_name,
                record_offset,
            }) => (file_name, record_offset as usize),
            Some(_) => {
                return Err(RegistryError::MalformedArchive {
                    registry: "euctr".into(),
                    reason: "expected a BulkFile cursor".into(),
                })
            }
            None => (
                path.file_name().unwrap().to_string_lossy().to_string(),
                0usize,
            ),
        };

        let export = Self::load_export(&path)?;
        let total = export.trials.len();
        let batch: Vec<_> = export
            .trials
            .into_iter()
            .skip(offset)
            .take(BATCH_SIZE)
            .collect();

        let records = batch
            .into_iter()
            .map(|t| {
                let native_id = t.eudract_number.clone();
                let raw = serde_json::to_value(&t).unwrap_or(Value::Null);
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
                registry: "euctr".into(),
                expected_path: self.drop_dir.path.display().to_string(),
            })?;
        let export = Self::load_export(&path)?;
        export
            .trials
            .into_iter()
            .find(|t| t.eudract_number == native_id)
            .map(|t| RawRecord {
                native_id: native_id.to_string(),
                raw: serde_json::to_value(&t).unwrap_or(Value::Null),
            })
            .ok_or_else(|| RegistryError::MalformedArchive {
                registry: "euctr".into(),
                reason: format!("no record {native_id} in current export"),
            })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError> {
        let t: EuctrTrial =
            serde_json::from_value(raw.raw.clone()).map_err(|e| NormalizationError::Failed {
                field: "<root>".into(),
                raw: e.to_string(),
            })?;

        let mut external_ids = HashMap::new();
        external_ids.insert("eudract".to_string(), t.eudract_number.clone());
        if let Some(nct) = &t.nct_number {
            external_ids.insert("nct".to_string(), nct.clone());
        }
        if let Some(protocol) = &t.sponsor_protocol_number {
            external_ids.insert("sponsor_protocol".to_string(), protocol.clone());
        }

        let conditions = t
            .medical_condition
            .as_deref()
            .map(|s| split_list(s, ';').into_iter().collect())
            .unwrap_or_default();

        let interventions = t
            .products
            .as_deref()
            .map(|s| {
                split_list(s, ';')
                    .into_iter()
                    .map(|name| Intervention {
                        kind: "Drug".to_string(),
                        name,
                        description: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let locations = t
            .member_states_concerned
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

        let gender = match t.gender.as_deref() {
            Some("Male") => Gender::Male,
            Some("Female") => Gender::Female,
            _ => Gender::All,
        };

        Ok(CanonicalTrial {
            trial_key: self.trial_key(&t.eudract_number),
            external_ids,
            title_official: t
                .full_title
                .clone()
                .or_else(|| t.public_title.clone())
                .unwrap_or_default(),
            title_brief: t.public_title.clone(),
            title_lay: None,
            description: None,
            conditions,
            interventions,
            phase: t.trial_phase.as_deref().map(parse_phase).unwrap_or(Phase::Na),
            status: t
                .trial_status
                .as_deref()
                .map(map_status)
                .unwrap_or(TrialStatus::Unknown),
            study_type: None,
            primary_outcomes: Vec::new(),
            secondary_outcomes: Vec::new(),
            enrollment_target: None,
            enrollment_actual: None,
            start_date: None,
            completion_date: Self::parse_date(&t.global_end_of_trial_date),
            last_update: Self::parse_date(&t.date_of_competent_authority_decision),
            first_posted: Self::parse_date(&t.date_of_competent_authority_decision),
            eligibility: Eligibility {
                inclusion_text: None,
                exclusion_text: None,
                gender,
                min_age: Self::age_bound(&t.age_range, true),
                max_age: Self::age_bound(&t.age_range, false),
            },
            locations,
            contacts: Vec::<TrialContact>::new(),
            sponsor: Sponsor {
                lead: t.sponsor_name.clone(),
                collaborators: Vec::new(),
            },
            source: Registry::EuCtr,
            raw_data: raw.raw.clone(),
        })
    }
}

/// Finds the lexicographically-latest file under `dir` matching
/// `{prefix}*.{ext}` — export files are named with a sortable date suffix
/// (e.g. `euctr_export_2026-07-01.zip`), so lexicographic order is date order.
pub(crate) fn latest_file_with_prefix(dir: &Path, prefix: &str, ext: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix) && n.ends_with(&format!(".{ext}")))
                .unwrap_or(false)
        })
        .max_by_key(|p| p.file_name().map(|n| n.to_os_string()))
}

/// Opens a ZIP archive and reads its single XML member to a string. Bulk
/// drops are expected to contain exactly one XML payload per §4.5.
pub(crate) fn extract_single_xml(path: &Path, registry: &str) -> Result<String, RegistryError> {
    let file = File::open(path).map_err(|e| RegistryError::MalformedArchive {
        registry: registry.into(),
        reason: format!("cannot open {}: {e}", path.display()),
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| RegistryError::MalformedArchive {
        registry: registry.into(),
        reason: format!("invalid zip: {e}"),
    })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| RegistryError::MalformedArchive {
                registry: registry.into(),
                reason: e.to_string(),
            })?;
        if entry.name().ends_with(".xml") {
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .map_err(|e| RegistryError::MalformedArchive {
                    registry: registry.into(),
                    reason: format!("cannot read xml entry: {e}"),
                })?;
            return Ok(contents);
        }
    }

    Err(RegistryError::MalformedArchive {
        registry: registry.into(),
        reason: "no .xml member found in archive".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_file_picks_lexicographically_newest() {
        let dir = std::env::temp_dir().join(format!("euctr-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["euctr_export_2026-01-01.zip", "euctr_export_2026-06-01.zip"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        let latest = latest_file_with_prefix(&dir, "euctr_export_", "zip").unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            "euctr_export_2026-06-01.zip"
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn age_range_splits_min_and_max_group() {
        let range = Some("adults-elderly".to_string());
        assert_eq!(EuCtrAdapter::age_bound(&range, true).unwrap().days, 18 * 365);
        assert_eq!(EuCtrAdapter::age_bound(&range, false).unwrap().days, 65 * 365);
    }
}
