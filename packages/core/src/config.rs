use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables. No
/// component reads `std::env` directly outside of this module; everything
/// downstream gets a `Config` injected at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub ctgov_base_url: String,
    pub isrctn_base_url: String,
    pub ctis_base_url: String,
    pub euctr_bulk_dir: String,
    pub ictrp_bulk_dir: String,

    pub geocoding_base_url: String,
    pub geocoding_user_agent: String,
    pub embeddings_api_key: Option<String>,
    pub embeddings_base_url: String,

    pub worker_min: usize,
    pub worker_max: usize,
    pub default_visibility_timeout: Duration,
    pub queues: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables, validated eagerly at
    /// startup so a misconfigured deployment fails fast with a named
    /// missing variable rather than a confusing downstream panic.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            ctgov_base_url: env::var("CTGOV_BASE_URL")
                .unwrap_or_else(|_| "https://clinicaltrials.gov/api/v2".to_string()),
            isrctn_base_url: env::var("ISRCTN_BASE_URL")
                .unwrap_or_else(|_| "https://www.isrctn.com/api".to_string()),
            ctis_base_url: env::var("CTIS_BASE_URL")
                .unwrap_or_else(|_| "https://euclinicaltrials.eu/ctis-public-api".to_string()),
            euctr_bulk_dir: env::var("EUCTR_BULK_DIR")
                .unwrap_or_else(|_| "./bulk-drops/euctr".to_string()),
            ictrp_bulk_dir: env::var("ICTRP_BULK_DIR")
                .unwrap_or_else(|_| "./bulk-drops/ictrp".to_string()),

            geocoding_base_url: env::var("GEOCODING_BASE_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string()),
            geocoding_user_agent: env::var("GEOCODING_USER_AGENT")
                .context("GEOCODING_USER_AGENT must be set (required by Nominatim usage policy)")?,
            embeddings_api_key: env::var("EMBEDDINGS_API_KEY").ok(),
            embeddings_base_url: env::var("EMBEDDINGS_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/embeddings".to_string()),

            worker_min: env::var("WORKER_MIN")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("WORKER_MIN must be a valid number")?,
            worker_max: env::var("WORKER_MAX")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("WORKER_MAX must be a valid number")?,
            default_visibility_timeout: Duration::from_secs(
                env::var("VISIBILITY_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("VISIBILITY_TIMEOUT_SECS must be a valid number")?,
            ),
            queues: env::var("QUEUES")
                .unwrap_or_else(|_| "scrape,dedupe,enrich,geocode".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_split_on_comma_and_trim_whitespace() {
        std::env::set_var("QUEUES", "scrape, dedupe ,enrich");
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("GEOCODING_USER_AGENT", "test-agent");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.queues, vec!["scrape", "dedupe", "enrich"]);
    }
}
