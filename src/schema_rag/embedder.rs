//! Schema Embedder
//!
//! Embeds catalog entries and questions through an OpenAI-compatible
//! `/embeddings` endpoint. Transient failures are retried with exponential
//! backoff before surfacing as `EmbeddingService` errors.

use crate::config::EmbeddingConfig;
use crate::error::{BiError, Result};
use crate::schema_rag::vector_store::Embedding;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BATCH_SIZE: usize = 64;
const MEMO_CAPACITY: usize = 1024;

/// Turns text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier; part of the vector cache key.
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Embedding>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Embedding client using the OpenAI embeddings API (also served by Ollama).
pub struct SchemaEmbedder {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    /// Question embeddings, so repeated questions skip the network.
    memo: DashMap<String, Embedding>,
}

impl SchemaEmbedder {
    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BiError::Config(format!("Failed to create HTTP client for embeddings: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            memo: DashMap::new(),
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(config.api_key.clone(), config.base_url.clone(), config.model.clone())
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Embedding>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BiError::EmbeddingService(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BiError::EmbeddingService(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BiError::EmbeddingService(format!("Failed to parse embedding response: {}", e)))?;

        parse_embeddings(&response_json, input.len())
    }

    async fn request_with_retry(&self, input: &[String]) -> Result<Vec<Embedding>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(input).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                    warn!(
                        "Embedding request failed ({}), retrying in {:?} ({} attempts left)",
                        e,
                        backoff,
                        MAX_ATTEMPTS - attempt
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Extract `data[].embedding`, honouring each item's `index`.
fn parse_embeddings(response: &serde_json::Value, expected: usize) -> Result<Vec<Embedding>> {
    let data = response
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| BiError::EmbeddingService("No embedding data in response".to_string()))?;

    let mut slots: Vec<Option<Embedding>> = vec![None; expected];
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding: Embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| BiError::EmbeddingService("No embedding vector in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(embedding);
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| BiError::EmbeddingService(format!("Missing embedding for input {}", i)))
        })
        .collect()
}

#[async_trait]
impl Embedder for SchemaEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(hit) = self.memo.get(text) {
            return Ok(hit.value().clone());
        }

        let mut vectors = self.request_with_retry(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| BiError::EmbeddingService("No embedding data in response".to_string()))?;

        if self.memo.len() >= MEMO_CAPACITY {
            self.memo.clear();
        }
        self.memo.insert(text.to_string(), vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            debug!("Embedding batch of {} entries", chunk.len());
            out.extend(self.request_with_retry(chunk).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_embeddings_respects_index() {
        let response = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_embeddings(&response, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_parse_embeddings_missing_item() {
        let response = json!({"data": [{"index": 0, "embedding": [1.0]}]});
        let err = parse_embeddings(&response, 2).unwrap_err();
        assert!(matches!(err, BiError::EmbeddingService(_)));
    }
}
