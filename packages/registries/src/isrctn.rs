//! ISRCTN registry adapter. Page-number pagination (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{Cursor, EnumeratePage, RateLimitedHttp, RawRecord, RegistryAdapter};
use crate::error::{NormalizationError, RegistryError};
use crate::model::{
    CanonicalTrial, Eligibility, Gender, Intervention, Phase, Registry, Sponsor, TrialContact,
    TrialLocation, TrialStatus,
};
use crate::normalize::{map_status, parse_age, parse_phase, split_list};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

const PAGE_SIZE: u32 = 50;

pub struct IsrctnAdapter {
    http: Arc<dyn RateLimitedHttp>,
    base_url: String,
}

impl IsrctnAdapter {
    pub fn new(http: Arc<dyn RateLimitedHttp>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn s(v: &Value, key: &str) -> Option<String> {
        v.get(key).and_then(|x| x.as_str()).map(String::from)
    }

    fn parse_date(v: &Value, key: &str) -> Option<DateTime<Utc>> {
        Self::s(v, key).and_then(|s| {
            NaiveDate::parse_from_str(&s, "%d/%m/%Y")
                .or_else(|_| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
                .ok()
                .map(|d| DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc))
        })
    }
}

#[async_trait]
impl RegistryAdapter for IsrctnAdapter {
    fn registry(&self) -> Registry {
        Registry::Isrctn
    }

    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError> {
        let page = match cursor {
            Some(Cursor::Page(p)) => p,
            Some(_) => {
                return Err(RegistryError::MalformedArchive {
                    registry: "isrctn".into(),
                    reason: "expected a Page cursor".into(),
                })
            }
            None => 1,
        };

        let url = format!(
            "{}/api/trials?page={}&pageSize={}&format=json",
            self.base_url.trim_end_matches('/'),
            page,
            PAGE_SIZE
        );
        let body = self.http.get_json(Registry::Isrctn, &url).await?;

        let trials = body
            .get("trials")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        let records = trials
            .into_iter()
            .filter_map(|raw| {
                Self::s(&raw, "isrctn").map(|native_id| RawRecord { native_id, raw })
            })
            .collect::<Vec<_>>();

        let total_estimate = body.get("totalResults").and_then(|t| t.as_u64());
        let next_cursor = if records.is_empty() {
            None
        } else {
            Some(Cursor::Page(page + 1))
        };

        Ok(EnumeratePage {
            records,
            next_cursor,
            total_estimate,
        })
    }

    async fn fetch(&self, native_id: &str) -> Result<RawRecord, RegistryError> {
        let url = format!(
            "{}/api/trials/ISRCTN{}?format=json",
            self.base_url.trim_end_matches('/'),
            native_id.trim_start_matches("ISRCTN")
        );
        let raw = self.http.get_json(Registry::Isrctn, &url).await?;
        Ok(RawRecord {
            native_id: native_id.to_string(),
            raw,
        })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError> {
        let v = &raw.raw;
        let isrctn = Self::s(v, "isrctn").ok_or(NormalizationError::MissingId)?;

        let mut external_ids = HashMap::new();
        external_ids.insert("isrctn".to_string(), format!("ISRCTN{isrctn}"));
        if let Some(nct) = Self::s(v, "nctId") {
            external_ids.insert("nct".to_string(), nct);
        }
        if let Some(eudract) = Self::s(v, "eudractNumber") {
            external_ids.insert("eudract".to_string(), eudract);
        }

        let conditions = v
            .get("conditions")
            .and_then(|c| c.as_str())
            .map(|s| split_list(s, ',').into_iter().collect())
            .unwrap_or_default();

        let interventions = v
            .get("interventions")
            .and_then(|i| i.as_str())
            .map(|s| {
                split_list(s, ',')
                    .into_iter()
                    .map(|name| Intervention {
                        kind: "Unspecified".to_string(),
                        name,
                        description: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let gender = match Self::s(v, "gender").as_deref() {
            Some("Male") => Gender::Male,
            Some("Female") => Gender::Female,
            _ => Gender::All,
        };

        let locations = v
            .get("trialCentres")
            .and_then(|l| l.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|l| TrialLocation {
                        facility: Self::s(l, "name"),
                        city: Self::s(l, "city"),
                        state: None,
                        country: Self::s(l, "country"),
                        status: None,
                        latitude: None,
                        longitude: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalTrial {
            trial_key: self.trial_key(&isrctn),
            external_ids,
            title_official: Self::s(v, "scientificTitle")
                .or_else(|| Self::s(v, "publicTitle"))
                .unwrap_or_default(),
            title_brief: Self::s(v, "publicTitle"),
            title_lay: Self::s(v, "plainEnglishSummary"),
            description: Self::s(v, "studyHypothesis"),
            conditions,
            interventions,
            phase: Self::s(v, "phase").map(|p| parse_phase(&p)).unwrap_or(Phase::Na),
            status: Self::s(v, "overallStatus")
                .map(|s| map_status(&s))
                .unwrap_or(TrialStatus::Unknown),
            study_type: Self::s(v, "studyDesign"),
            primary_outcomes: v
                .get("primaryOutcome")
                .and_then(|o| o.as_str())
                .map(|s| split_list(s, ';'))
                .unwrap_or_default(),
            secondary_outcomes: v
                .get("secondaryOutcome")
                .and_then(|o| o.as_str())
                .map(|s| split_list(s, ';'))
                .unwrap_or_default(),
            enrollment_target: v
                .get("targetEnrollment")
                .and_then(|e| e.as_i64())
                .map(|v| v as i32),
            enrollment_actual: None,
            start_date: Self::parse_date(v, "overallTrialStartDate"),
            completion_date: Self::parse_date(v, "overallTrialEndDate"),
            last_update: Self::parse_date(v, "lastUpdated"),
            first_posted: Self::parse_date(v, "dateApplied"),
            eligibility: Eligibility {
                inclusion_text: Self::s(v, "participantInclusionCriteria"),
                exclusion_text: Self::s(v, "participantExclusionCriteria"),
                gender,
                min_age: Self::s(v, "lowerAgeLimit").and_then(|s| parse_age(&s)),
                max_age: Self::s(v, "upperAgeLimit").and_then(|s| parse_age(&s)),
            },
            locations,
            contacts: Vec::<TrialContact>::new(),
            sponsor: Sponsor {
                lead: Self::s(v, "sponsorName"),
                collaborators: v
                    .get("funders")
                    .and_then(|f| f.as_str())
                    .map(|s| split_list(s, ','))
                    .unwrap_or_default(),
            },
            source: Registry::Isrctn,
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

    fn adapter() -> IsrctnAdapter {
        IsrctnAdapter::new(Arc::new(NullHttp), "https://www.isrctn.com")
    }

    #[test]
    fn splits_comma_delimited_conditions() {
        let raw = RawRecord {
            native_id: "12345678".into(),
            raw: json!({"isrctn": "12345678", "conditions": "Diabetes, Obesity", "publicTitle": "Test"}),
        };
        let trial = adapter().normalize(&raw).unwrap();
        assert_eq!(trial.conditions.len(), 2);
        assert!(trial.conditions.contains("Diabetes"));
        assert_eq!(trial.external_ids.get("isrctn").unwrap(), "ISRCTN12345678");
    }
}
