//! Rate-limited HTTP client implementing `registries::RateLimitedHttp`.
//! `reqwest::Client` construction is grounded on `SimpleScraper::new`'s
//! browser-like builder; the request path adds the token-bucket/backoff
//! policy from §4.1 that adapters never see directly.

use std::time::Duration;

use registries::{RateLimitedHttp, Registry, RegistryError};
use tracing::warn;

use super::rate_limiter::{full_jitter_backoff, RateLimiter};

const MAX_RETRIES: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct RateLimitedClient {
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl RateLimitedClient {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent.to_string())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            limiter: RateLimiter::new(),
        })
    }

    fn bucket_key(registry: Registry) -> &'static str {
        registry.as_external_id_key()
    }

    /// Exposes the underlying limiter for the monitoring subsystem's
    /// rate-limit-usage check (§4.7); adapters never see this.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn request_with_retry(
        &self,
        registry: Registry,
        url: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let key = Self::bucket_key(registry);
        let mut last_status: Option<u16> = None;

        for attempt in 1..=MAX_RETRIES {
            self.limiter.acquire(key).await;

            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| RegistryError::Request(format!("{registry:?}"), e))?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            last_status = Some(status.as_u16());

            if status.as_u16() == 429 {
                self.limiter.halve_budget(key);
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| full_jitter_backoff(attempt, BACKOFF_BASE, BACKOFF_CAP));
                warn!(registry = ?registry, attempt, "rate limited (429), backing off");
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                let backoff = full_jitter_backoff(attempt, BACKOFF_BASE, BACKOFF_CAP);
                warn!(registry = ?registry, attempt, status = status.as_u16(), "server error, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            return Err(RegistryError::Unavailable {
                registry: format!("{registry:?}"),
                last_status: Some(status.as_u16()),
            });
        }

        Err(RegistryError::Unavailable {
            registry: format!("{registry:?}"),
            last_status,
        })
    }
}

#[async_trait::async_trait]
impl RateLimitedHttp for RateLimitedClient {
    async fn get_json(
        &self,
        registry: Registry,
        url: &str,
    ) -> Result<serde_json::Value, RegistryError> {
        let resp = self.request_with_retry(registry, url).await?;
        resp.json()
            .await
            .map_err(|e| RegistryError::Request(format!("{registry:?}"), e))
    }

    async fn get_text(&self, registry: Registry, url: &str) -> Result<String, RegistryError> {
        let resp = self.request_with_retry(registry, url).await?;
        resp.text()
            .await
            .map_err(|e| RegistryError::Request(format!("{registry:?}"), e))
    }

    async fn get_bytes(&self, registry: Registry, url: &str) -> Result<Vec<u8>, RegistryError> {
        let resp = self.request_with_retry(registry, url).await?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| RegistryError::Request(format!("{registry:?}"), e))
    }
}
