//! ClinicalTrials.gov API v2 adapter. Pagination-by-token (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{Cursor, EnumeratePage, RateLimitedHttp, RawRecord, RegistryAdapter};
use crate::error::{NormalizationError, RegistryError};
use crate::model::{
    CanonicalTrial, Eligibility, Gender, Intervention, Phase, Registry, Sponsor, TrialContact,
    TrialLocation, TrialStatus,
};
use crate::normalize::{map_status, parse_age, parse_phase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

const DEFAULT_PAGE_SIZE: u32 = 100;

pub struct CtGovAdapter {
    http: Arc<dyn RateLimitedHttp>,
    base_url: String,
}

impl CtGovAdapter {
    pub fn new(http: Arc<dyn RateLimitedHttp>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn list_url(&self, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/studies?pageSize={}&format=json",
            self.base_url.trim_end_matches('/'),
            DEFAULT_PAGE_SIZE
        );
        if let Some(token) = cursor {
            url.push_str(&format!("&pageToken={token}"));
        }
        url
    }

    fn str_field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
        let mut cur = v;
        for key in path {
            cur = cur.get(key)?;
        }
        cur.as_str()
    }
}

#[async_trait]
impl RegistryAdapter for CtGovAdapter {
    fn registry(&self) -> Registry {
        Registry::CtGov
    }

    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError> {
        let token = match cursor {
            Some(Cursor::PageToken(t)) => Some(t),
            Some(_) => {
                return Err(RegistryError::MalformedArchive {
                    registry: "ctgov".into(),
                    reason: "expected a PageToken cursor".into(),
                })
            }
            None => None,
        };

        let url = self.list_url(token.as_deref());
        let body = self.http.get_json(Registry::CtGov, &url).await?;

        let studies = body
            .get("studies")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();

        let records = studies
            .into_iter()
            .filter_map(|raw| {
                let nct_id = Self::str_field(&raw, &["protocolSection", "identificationModule", "nctId"])
                    .map(|s| s.to_string());
                nct_id.map(|native_id| RawRecord { native_id, raw })
            })
            .collect::<Vec<_>>();

        let next_cursor = body
            .get("nextPageToken")
            .and_then(|t| t.as_str())
            .map(|t| Cursor::PageToken(t.to_string()));

        let total_estimate = body.get("totalCount").and_then(|t| t.as_u64());

        Ok(EnumeratePage {
            records,
            next_cursor,
            total_estimate,
        })
    }

    async fn fetch(&self, native_id: &str) -> Result<RawRecord, RegistryError> {
        let url = format!(
            "{}/studies/{}?format=json",
            self.base_url.trim_end_matches('/'),
            native_id
        );
        let raw = self.http.get_json(Registry::CtGov, &url).await?;
        Ok(RawRecord {
            native_id: native_id.to_string(),
            raw,
        })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError> {
        let v = &raw.raw;
        let protocol = v.get("protocolSection").ok_or(NormalizationError::Failed {
            field: "protocolSection".into(),
            raw: v.to_string(),
        })?;

        let nct_id = Self::str_field(v, &["protocolSection", "identificationModule", "nctId"])
            .ok_or(NormalizationError::MissingId)?
            .to_string();

        let mut external_ids = HashMap::new();
        external_ids.insert("nct".to_string(), nct_id.clone());
        if let Some(secondary) = protocol
            .get("identificationModule")
            .and_then(|m| m.get("secondaryIdInfos"))
            .and_then(|v| v.as_array())
        {
            for id in secondary {
                if let Some(id_str) = id.get("id").and_then(|v| v.as_str()) {
                    if id_str.to_uppercase().starts_with("ISRCTN") {
                        external_ids.insert("isrctn".to_string(), id_str.to_string());
                    } else if id_str.to_uppercase().starts_with("EUDRACT")
                        || id_str.contains('-')
                    {
                        external_ids.insert("eudract".to_string(), id_str.to_string());
                    } else {
                        external_ids
                            .entry("sponsor_protocol".to_string())
                            .or_insert_with(|| id_str.to_string());
                    }
                }
            }
        }

        let title_official = Self::str_field(v, &["protocolSection", "identificationModule", "officialTitle"])
            .or_else(|| Self::str_field(v, &["protocolSection", "identificationModule", "briefTitle"]))
            .unwrap_or_default()
            .to_string();
        let title_brief = Self::str_field(v, &["protocolSection", "identificationModule", "briefTitle"])
            .map(|s| s.to_string());

        let conditions = protocol
            .get("conditionsModule")
            .and_then(|m| m.get("conditions"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let interventions = protocol
            .get("armsInterventionsModule")
            .and_then(|m| m.get("interventions"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|i| Intervention {
                        kind: i
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string(),
                        name: i
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        description: i
                            .get("description")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let phase = protocol
            .get("designModule")
            .and_then(|m| m.get("phases"))
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|p| p.as_str())
            .map(parse_phase)
            .unwrap_or(Phase::Na);

        let status = Self::str_field(v, &["protocolSection", "statusModule", "overallStatus"])
            .map(map_status)
            .unwrap_or(TrialStatus::Unknown);

        let eligibility_module = protocol.get("eligibilityModule");
        let gender = eligibility_module
            .and_then(|m| m.get("sex"))
            .and_then(|v| v.as_str())
            .map(|s| match s.to_uppercase().as_str() {
                "MALE" => Gender::Male,
                "FEMALE" => Gender::Female,
                _ => Gender::All,
            })
            .unwrap_or(Gender::All);
        let min_age = eligibility_module
            .and_then(|m| m.get("minimumAge"))
            .and_then(|v| v.as_str())
            .and_then(parse_age);
        let max_age = eligibility_module
            .and_then(|m| m.get("maximumAge"))
            .and_then(|v| v.as_str())
            .and_then(parse_age);

        let locations = protocol
            .get("contactsLocationsModule")
            .and_then(|m| m.get("locations"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|l| TrialLocation {
                        facility: l.get("facility").and_then(|v| v.as_str()).map(String::from),
                        city: l.get("city").and_then(|v| v.as_str()).map(String::from),
                        state: l.get("state").and_then(|v| v.as_str()).map(String::from),
                        country: l.get("country").and_then(|v| v.as_str()).map(String::from),
                        status: l.get("status").and_then(|v| v.as_str()).map(String::from),
                        latitude: l
                            .get("geoPoint")
                            .and_then(|g| g.get("lat"))
                            .and_then(|v| v.as_f64()),
                        longitude: l
                            .get("geoPoint")
                            .and_then(|g| g.get("lon"))
                            .and_then(|v| v.as_f64()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let contacts = protocol
            .get("contactsLocationsModule")
            .and_then(|m| m.get("centralContacts"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|c| TrialContact {
                        name: c.get("name").and_then(|v| v.as_str()).map(String::from),
                        email: c.get("email").and_then(|v| v.as_str()).map(String::from),
                        phone: c.get("phone").and_then(|v| v.as_str()).map(String::from),
                        role: c.get("role").and_then(|v| v.as_str()).map(String::from),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let sponsor = Sponsor {
            lead: protocol
                .get("sponsorCollaboratorsModule")
                .and_then(|m| m.get("leadSponsor"))
                .and_then(|s| s.get("name"))
                .and_then(|v| v.as_str())
                .map(String::from),
            collaborators: protocol
                .get("sponsorCollaboratorsModule")
                .and_then(|m| m.get("collaborators"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| c.get("name").and_then(|v| v.as_str()).map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        };

        let parse_date = |path: &[&str]| -> Option<DateTime<Utc>> {
            Self::str_field(v, path).and_then(|s| {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .or_else(|_| chrono::NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d"))
                    .ok()
                    .map(|d| DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc))
            })
        };

        Ok(CanonicalTrial {
            trial_key: self.trial_key(&nct_id),
            external_ids,
            title_official,
            title_brief,
            title_lay: None,
            description: Self::str_field(v, &["protocolSection", "descriptionModule", "briefSummary"])
                .map(String::from),
            conditions,
            interventions,
            phase,
            status,
            study_type: Self::str_field(v, &["protocolSection", "designModule", "studyType"])
                .map(String::from),
            primary_outcomes: protocol
                .get("outcomesModule")
                .and_then(|m| m.get("primaryOutcomes"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|o| o.get("measure").and_then(|v| v.as_str()).map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            secondary_outcomes: protocol
                .get("outcomesModule")
                .and_then(|m| m.get("secondaryOutcomes"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|o| o.get("measure").and_then(|v| v.as_str()).map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            enrollment_target: protocol
                .get("designModule")
                .and_then(|m| m.get("enrollmentInfo"))
                .and_then(|e| e.get("count"))
                .and_then(|v| v.as_i64())
                .map(|v| v as i32),
            enrollment_actual: None,
            start_date: parse_date(&["protocolSection", "statusModule", "startDateStruct", "date"]),
            completion_date: parse_date(&[
                "protocolSection",
                "statusModule",
                "completionDateStruct",
                "date",
            ]),
            last_update: parse_date(&[
                "protocolSection",
                "statusModule",
                "lastUpdatePostDateStruct",
                "date",
            ]),
            first_posted: parse_date(&[
                "protocolSection",
                "statusModule",
                "studyFirstPostDateStruct",
                "date",
            ]),
            eligibility: Eligibility {
                inclusion_text: Self::str_field(v, &["protocolSection", "eligibilityModule", "eligibilityCriteria"])
                    .map(String::from),
                exclusion_text: None,
                gender,
                min_age,
                max_age,
            },
            locations,
            contacts,
            sponsor,
            source: Registry::CtGov,
            raw_data: v.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullHttp;

    #[async_trait]
    impl RateLimitedHttp for NullHttp {
        async fn get_json(&self, _: Registry, _: &str) -> Result<Value, RegistryError> {
            unimplemented!()
        }
        async fn get_text(&self, _: Registry, _: &str) -> Result<String, RegistryError> {
            unimplemented!()
        }
        async fn get_bytes(&self, _: Registry, _: &str) -> Result<Vec<u8>, RegistryError> {
            unimplemented!()
        }
    }

    fn adapter() -> CtGovAdapter {
        CtGovAdapter::new(Arc::new(NullHttp), "https://clinicaltrials.gov/api/v2")
    }

    #[test]
    fn normalizes_minimal_study_into_canonical_trial() {
        let raw = RawRecord {
            native_id: "NCT01".into(),
            raw: json!({
                "protocolSection": {
                    "identificationModule": {"nctId": "NCT01", "briefTitle": "Metformin in T2D"},
                    "statusModule": {"overallStatus": "RECRUITING"},
                    "conditionsModule": {"conditions": ["Diabetes"]},
                    "eligibilityModule": {"sex": "ALL", "minimumAge": "18 Years", "maximumAge": "65 Years"}
                }
            }),
        };
        let trial = adapter().normalize(&raw).unwrap();
        assert_eq!(trial.trial_key, "ctgov:nct01");
        assert_eq!(trial.external_ids.get("nct"), Some(&"NCT01".to_string()));
        assert_eq!(trial.status, TrialStatus::Recruiting);
        assert_eq!(trial.conditions, ["Diabetes".to_string()].into_iter().collect());
        assert_eq!(trial.eligibility.min_age.as_ref().unwrap().days, 18 * 365);
    }

    #[test]
    fn missing_nct_id_is_a_normalization_error() {
        let raw = RawRecord {
            native_id: "x".into(),
            raw: json!({"protocolSection": {}}),
        };
        assert!(matches!(
            adapter().normalize(&raw),
            Err(NormalizationError::MissingId)
        ));
    }
}
