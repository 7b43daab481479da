//! Embedding provider interface and the HTTP implementation.
//!
//! `embed` is batchable and returns vectors of a fixed dimension D.
//! Failures surface to callers; the core does not retry.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

/// OpenAI-style `/embeddings` client. A missing API key surfaces as a
/// dependency error at call time, not at construction, so components
/// that never embed can still start.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::dependency("embedding_provider", e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
            api_key_env: config.api_key_env.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            RagError::dependency(
                "embedding_provider",
                format!("API key env var {} is not set", self.api_key_env),
            )
        })?;

        let request = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::transient("embedding", "request timed out")
                } else {
                    RagError::dependency("embedding_provider", e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RagError::transient(
                "embedding",
                format!("provider returned {}", status),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::dependency(
                "embedding_provider",
                format!("{}: {}", status, body.chars().take(300).collect::<String>()),
            ));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::dependency("embedding_provider", format!("bad response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::dependency(
                "embedding_provider",
                format!(
                    "expected {} vectors, got {}",
                    texts.len(),
                    parsed.data.len()
                ),
            ));
        }

        // Providers may reorder; the index field restores input order.
        let mut ordered: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        for datum in parsed.data {
            if datum.embedding.len() != self.dimension {
                return Err(RagError::dependency(
                    "embedding_provider",
                    format!(
                        "vector dimension {} does not match configured {}",
                        datum.embedding.len(),
                        self.dimension
                    ),
                ));
            }
            if datum.index >= ordered.len() {
                return Err(RagError::dependency(
                    "embedding_provider",
                    "response index out of range",
                ));
            }
            ordered[datum.index] = datum.embedding;
        }
        Ok(ordered)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
