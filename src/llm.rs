//! Language model client
//!
//! The orchestrator only needs `generate(prompt) -> text`. `ChatModel` speaks
//! the OpenAI chat completions API, which Ollama also serves under `/v1`.

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{BiError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You translate business questions into a single read-only SQL query. \
Reply with the SQL only.";

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct ChatModel {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl ChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BiError::Config(format!("Failed to create HTTP client for the model: {}", e)))?;

        // Ollama ignores the key; OpenAI requires it and config validation checks that.
        let api_key = match config.provider {
            LlmProvider::OpenAi => config.api_key.clone(),
            LlmProvider::Ollama => None,
        };

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
            "max_tokens": 1000
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BiError::ModelTimeout(self.timeout)
            } else {
                BiError::ModelUnavailable(format!("LLM API call failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BiError::ModelUnavailable(format!("LLM API returned {}: {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BiError::ModelUnavailable(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BiError::ModelUnavailable("No content in LLM response".to_string()))?;

        debug!("Model {} answered with {} chars", self.model, content.len());
        Ok(content.to_string())
    }
}

lazy_static! {
    static ref FENCED: Regex = Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").unwrap();
    static ref QUERY_START: Regex = Regex::new(r"(?i)\b(SELECT|WITH)\b").unwrap();
}

/// Pull the SQL out of a model reply: fenced block first, else from the first
/// SELECT/WITH onwards, else the trimmed reply.
pub fn extract_sql(reply: &str) -> String {
    let body = match FENCED.captures(reply).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => match QUERY_START.find(reply) {
            Some(m) => &reply[m.start()..],
            None => reply,
        },
    };
    body.trim().to_string()
}
