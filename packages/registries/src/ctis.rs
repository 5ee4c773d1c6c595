//! EU Clinical Trials Information System adapter. Offset pagination (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{Cursor, EnumeratePage, RateLimitedHttp, RawRecord, RegistryAdapter};
use crate::error::{NormalizationError, RegistryError};
use crate::model::{
    age_group_to_days, AgeBound, CanonicalTrial, Eligibility, Gender, Intervention, Phase,
    Registry, Sponsor, TrialContact, TrialLocation, TrialStatus,
};
use crate::normalize::{map_status, parse_phase, split_list};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

const PAGE_SIZE: u64 = 50;

pub struct CtisAdapter {
    http: Arc<dyn RateLimitedHttp>,
    base_url: String,
}

impl CtisAdapter {
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
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .ok()
                .map(|d| DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc))
        })
    }

    /// CTIS/EU CTR represent age eligibility as group flags rather than a
    /// free-text age, per §4.5's fixed age-group table.
    fn age_group_bound(v: &Value, key: &str) -> Option<AgeBound> {
        let group = Self::s(v, key)?;
        let days = age_group_to_days(&group)?;
        Some(AgeBound {
            days,
            original: group,
        })
    }
}

#[async_trait]
impl RegistryAdapter for CtisAdapter {
    fn registry(&self) -> Registry {
        Registry::Ctis
    }

    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError> {
        let offset = match cursor {
            Some(Cursor::Offset(o)) => o,
            Some(_) => {
                return Err(RegistryError::MalformedArchive {
                    registry: "ctis".into(),
                    reason: "expected an Offset cursor".into(),
                })
            }
            None => 0,
        };

        let url = format!(
            "{}/trials/search?offset={}&limit={}",
            self.base_url.trim_end_matches('/'),
            offset,
            PAGE_SIZE
        );
        let body = self.http.get_json(Registry::Ctis, &url).await?;

        let trials = body
            .get("results")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        let batch_len = trials.len() as u64;
        let records = trials
            .into_iter()
            .filter_map(|raw| {
                Self::s(&raw, "ctNumber").map(|native_id| RawRecord { native_id, raw })
            })
            .collect::<Vec<_>>();

        let next_cursor = if batch_len < PAGE_SIZE {
            None
        } else {
            Some(Cursor::Offset(offset + PAGE_SIZE))
        };

        Ok(EnumeratePage {
            records,
            next_cursor,
            total_estimate: body.get("totalResults").and_then(|t| t.as_u64()),
        })
    }

    async fn fetch(&self, native_id: &str) -> Result<RawRecord, RegistryError> {
        let url = format!(
            "{}/trials/{}",
            self.base_url.trim_end_matches('/'),
            native_id
        );
        let raw = self.http.get_json(Registry::Ctis, &url).await?;
        Ok(RawRecord {
            native_id: native_id.to_string(),
            raw,
        })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError> {
        let v = &raw.raw;
        let ct_number = Self::s(v, "ctNumber").ok_or(NormalizationError::MissingId)?;

        let mut external_ids = HashMap::new();
        external_ids.insert("ctis".to_string(), ct_number.clone());
        if let Some(eudract) = Self::s(v, "eudractNumber") {
            external_ids.insert("eudract".to_string(), eudract);
        }
        if let Some(protocol) = Self::s(v, "sponsorProtocolNumber") {
            external_ids.insert("sponsor_protocol".to_string(), protocol);
        }

        let conditions = v
            .get("therapeuticAreas")
            .and_then(|c| c.as_str())
            .map(|s| split_list(s, ';').into_iter().collect())
            .unwrap_or_default();

        let interventions = v
            .get("productNames")
            .and_then(|i| i.as_str())
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

        let locations = v
            .get("memberStates")
            .and_then(|l| l.as_str())
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

        Ok(CanonicalTrial {
            trial_key: self.trial_key(&ct_number),
            external_ids,
            title_official: Self::s(v, "publicTitle")
                .or_else(|| Self::s(v, "scientificTitle"))
                .unwrap_or_default(),
            title_brief: Self::s(v, "publicTitle"),
            title_lay: Self::s(v, "layTitle"),
            description: Self::s(v, "trialDescription"),
            conditions,
            interventions,
            phase: Self::s(v, "trialPhase").map(|p| parse_phase(&p)).unwrap_or(Phase::Na),
            status: Self::s(v, "overallStatus")
                .map(|s| map_status(&s))
                .unwrap_or(TrialStatus::Unknown),
            study_type: Self::s(v, "trialType"),
            primary_outcomes: v
                .get("primaryEndPoint")
                .and_then(|o| o.as_str())
                .map(|s| split_list(s, ';'))
                .unwrap_or_default(),
            secondary_outcomes: v
                .get("secondaryEndPoint")
                .and_then(|o| o.as_str())
                .map(|s| split_list(s, ';'))
                .unwrap_or_default(),
            enrollment_target: v
                .get("plannedSubjects")
                .and_then(|e| e.as_i64())
                .map(|v| v as i32),
            enrollment_actual: None,
            start_date: Self::parse_date(v, "trialStartDate"),
            completion_date: Self::parse_date(v, "trialEndDate"),
            last_update: Self::parse_date(v, "lastUpdateDate"),
            first_posted: Self::parse_date(v, "decisionDate"),
            eligibility: Eligibility {
                inclusion_text: Self::s(v, "inclusionCriteria"),
                exclusion_text: Self::s(v, "exclusionCriteria"),
                gender: Gender::All,
                min_age: Self::age_group_bound(v, "ageGroupMin"),
                max_age: Self::age_group_bound(v, "ageGroupMax"),
            },
            locations,
            contacts: Vec::<TrialContact>::new(),
            sponsor: Sponsor {
                lead: Self::s(v, "sponsorName"),
                collaborators: Vec::new(),
            },
            source: Registry::Ctis,
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

    fn adapter() -> CtisAdapter {
        CtisAdapter::new(Arc::new(NullHttp), "https://euclinicaltrials.eu/ctis-public-api")
    }

    #[test]
    fn maps_age_group_flags_via_fixed_table() {
        let raw = RawRecord {
            native_id: "2024-500001-10".into(),
            raw: json!({
                "ctNumber": "2024-500001-10",
                "ageGroupMin": "adults",
                "ageGroupMax": "elderly",
            }),
        };
        let trial = adapter().normalize(&raw).unwrap();
        assert_eq!(trial.eligibility.min_age.unwrap().days, 18 * 365);
        assert_eq!(trial.eligibility.max_age.unwrap().days, 65 * 365);
    }
}
