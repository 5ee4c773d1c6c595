//! Embedding client for trial enrichment (§4.1 "Enrich"). Grounded on
//! `common::utils::embeddings::EmbeddingService`, generalized to a
//! configurable base URL/model instead of a hardcoded OpenAI endpoint.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const MODEL: &str = "text-embedding-3-small";

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn generate(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct OpenAiEmbeddingClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&EmbeddingRequest { model: MODEL, input: text })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("embeddings API error {status}: {body}");
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("embeddings API returned no data"))
    }
}
