//! Geocoding client for trial location enrichment (§6 "Nominatim, 1
//! req/sec, User-Agent required"). Grounded on
//! `common::utils::geocoding::geocode_city`, generalized to accept a
//! full free-text location string (trial locations carry facility/
//! city/state/country, not just city+state) and stripped of the
//! member-privacy coordinate coarsening, which has no reason to apply to
//! a public trial site.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::rate_limiter::RateLimiter;

#[derive(Debug, Deserialize)]
struct NominatimResult {
    lat: String,
    lon: String,
    display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

pub struct GeocodingClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

const BUCKET: &str = "geocoding";

impl GeocodingClient {
    pub fn new(base_url: impl Into<String>, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            limiter: RateLimiter::new(),
        })
    }

    #[instrument(skip(self))]
    pub async fn geocode(&self, query: &str) -> Result<GeocodedLocation> {
        self.limiter.acquire(BUCKET).await;

        let url = format!(
            "{}/search?q={}&format=json&limit=1",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(query)
        );

        debug!(query, "geocoding location");
        let results: Vec<NominatimResult> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("geocoding request failed: {e}"))?
            .json()
            .await
            .map_err(|e| anyhow!("failed to parse geocoding response: {e}"))?;

        let first = results.first().ok_or_else(|| {
            warn!(query, "location not found by geocoding API");
            anyhow!("location not found: {query}")
        })?;

        Ok(GeocodedLocation {
            latitude: first.lat.parse().map_err(|e| anyhow!("invalid latitude: {e}"))?,
            longitude: first.lon.parse().map_err(|e| anyhow!("invalid longitude: {e}"))?,
            display_name: first.display_name.clone(),
        })
    }
}
