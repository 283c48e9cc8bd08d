//! Application configuration
//!
//! Every setting comes from the environment (a `.env` file is honoured) and
//! falls back to a local-first default: embedded warehouse, Ollama model,
//! lexical retrieval when no embedding endpoint is reachable.

use crate::error::{BiError, Result};
use crate::warehouse::WarehouseTarget;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Hard cap on retrieval top-k; larger requests are clamped.
pub const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProvider {
    Ollama,
    OpenAi,
}

impl FromStr for LlmProvider {
    type Err = BiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(LlmProvider::Ollama),
            "openai" => Ok(LlmProvider::OpenAi),
            other => Err(BiError::Config(format!("Unknown LLM provider: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// When false the index is built in lexical mode without calling out.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub api_base: String,
    pub project_id: Option<String>,
    pub dataset: Option<String>,
    pub location: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnowflakeConfig {
    pub account: Option<String>,
    pub token: Option<String>,
    pub token_type: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub role: Option<String>,
}

/// Limits shared by the guardrail, the router and the orchestrator.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_rows: u64,
    pub default_row_limit: u64,
    pub query_timeout: Duration,
    pub max_reprompts: u32,
    pub max_connection_retries: u32,
    pub allowed_schemas: Vec<String>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            default_row_limit: 1_000,
            query_timeout: Duration::from_secs(300),
            max_reprompts: 2,
            max_connection_retries: 3,
            allowed_schemas: vec!["seeds.*".to_string()],
        }
    }
}

impl SafetyLimits {
    /// Injected limit, never above the configured maximum.
    pub fn effective_default_limit(&self) -> u64 {
        self.default_row_limit.min(self.max_rows).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub warehouse: WarehouseTarget,
    pub embedded: EmbeddedConfig,
    pub bigquery: BigQueryConfig,
    pub snowflake: SnowflakeConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub catalog_dir: PathBuf,
    pub catalog_database_url: Option<String>,
    pub catalog_schemas: Vec<String>,
    pub examples_path: Option<PathBuf>,
    pub vector_dir: PathBuf,
    pub retrieval_top_k: usize,
    pub limits: SafetyLimits,
    pub pool: PoolConfig,
    pub query_log_path: Option<PathBuf>,
    pub log_level: String,
    /// Bind address of the HTTP server
    pub server_addr: String,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let warehouse = WarehouseTarget::from_str(&get_or("WAREHOUSE", "EMBEDDED"))?;

        let provider = LlmProvider::from_str(&get_or("LLM_PROVIDER", "ollama"))?;
        let api_key = get("OPENAI_API_KEY");
        let (default_llm_url, default_model) = match provider {
            LlmProvider::Ollama => ("http://localhost:11434/v1", "llama3.1"),
            LlmProvider::OpenAi => ("https://api.openai.com/v1", "gpt-4"),
        };
        let llm = LlmConfig {
            provider,
            base_url: get_or("LLM_BASE_URL", default_llm_url),
            model: get("LLM_MODEL")
                .or_else(|| get("OLLAMA_MODEL"))
                .unwrap_or_else(|| default_model.to_string()),
            api_key: api_key.clone(),
            timeout: Duration::from_secs(parse_num(get("MODEL_TIMEOUT"), 60, "MODEL_TIMEOUT")?),
            temperature: 0.1,
        };

        let embedding_base = get_or("EMBEDDING_BASE_URL", &llm.base_url);
        let embedding = EmbeddingConfig {
            enabled: api_key.is_some() || is_local_url(&embedding_base),
            base_url: embedding_base,
            model: get_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            api_key,
        };

        let limits = SafetyLimits {
            max_rows: parse_num(get("MAX_ROWS"), 10_000, "MAX_ROWS")?,
            default_row_limit: parse_num(get("DEFAULT_ROW_LIMIT"), 1_000, "DEFAULT_ROW_LIMIT")?,
            query_timeout: Duration::from_secs(parse_num(get("QUERY_TIMEOUT"), 300, "QUERY_TIMEOUT")?),
            max_reprompts: parse_num(get("MAX_REPROMPTS"), 2, "MAX_REPROMPTS")?,
            max_connection_retries: parse_num(
                get("MAX_CONNECTION_RETRIES"),
                3,
                "MAX_CONNECTION_RETRIES",
            )?,
            allowed_schemas: split_list(&get_or("ALLOWED_SCHEMAS", "seeds.*")),
        };
        if limits.max_rows == 0 {
            return Err(BiError::Config("MAX_ROWS must be at least 1".to_string()));
        }

        let config = Self {
            warehouse,
            embedded: EmbeddedConfig {
                path: PathBuf::from(get_or("EMBEDDED_DB_PATH", ".data/local.sqlite")),
            },
            bigquery: BigQueryConfig {
                api_base: get_or("BQ_API_BASE", "https://bigquery.googleapis.com/bigquery/v2"),
                project_id: get("BQ_PROJECT_ID"),
                dataset: get("BQ_DATASET"),
                location: get_or("BQ_LOCATION", "US"),
                access_token: get("BQ_ACCESS_TOKEN"),
            },
            snowflake: SnowflakeConfig {
                account: get("SNOWFLAKE_ACCOUNT"),
                token: get("SNOWFLAKE_TOKEN"),
                token_type: get_or("SNOWFLAKE_TOKEN_TYPE", "OAUTH"),
                warehouse: get("SNOWFLAKE_WAREHOUSE"),
                database: get("SNOWFLAKE_DATABASE"),
                schema: get("SNOWFLAKE_SCHEMA"),
                role: get("SNOWFLAKE_ROLE"),
            },
            llm,
            embedding,
            catalog_dir: PathBuf::from(get_or("CATALOG_DIR", "catalog")),
            catalog_database_url: get("CATALOG_DATABASE_URL"),
            catalog_schemas: split_list(&get_or("CATALOG_SCHEMAS", "public")),
            examples_path: get("EXAMPLES_PATH").map(PathBuf::from),
            vector_dir: PathBuf::from(get_or("VECTOR_DIR", ".data/vector")),
            retrieval_top_k: parse_num::<usize>(get("RETRIEVAL_TOP_K"), 8, "RETRIEVAL_TOP_K")?
                .clamp(1, MAX_TOP_K),
            limits,
            pool: PoolConfig {
                size: parse_num::<usize>(get("POOL_SIZE"), 4, "POOL_SIZE")?.max(1),
                acquire_timeout: Duration::from_secs(parse_num(
                    get("POOL_ACQUIRE_TIMEOUT"),
                    30,
                    "POOL_ACQUIRE_TIMEOUT",
                )?),
            },
            query_log_path: get("QUERY_LOG_PATH").map(PathBuf::from),
            log_level: get_or("LOG_LEVEL", "info").to_lowercase(),
            server_addr: get_or("SERVER_ADDR", "0.0.0.0:8080"),
        };

        Ok(config)
    }

    /// Check that the selected warehouse and model provider are usable.
    pub fn validate(&self) -> Result<()> {
        self.validate_target(self.warehouse)?;
        if self.llm.provider == LlmProvider::OpenAi && self.llm.api_key.is_none() {
            return Err(BiError::Config(
                "OPENAI_API_KEY is required for the openai provider".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_target(&self, target: WarehouseTarget) -> Result<()> {
        let missing: Vec<&str> = match target {
            WarehouseTarget::Embedded => Vec::new(),
            WarehouseTarget::BigQuery => [
                ("BQ_PROJECT_ID", self.bigquery.project_id.is_some()),
                ("BQ_DATASET", self.bigquery.dataset.is_some()),
                ("BQ_ACCESS_TOKEN", self.bigquery.access_token.is_some()),
            ]
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect(),
            WarehouseTarget::Snowflake => [
                ("SNOWFLAKE_ACCOUNT", self.snowflake.account.is_some()),
                ("SNOWFLAKE_TOKEN", self.snowflake.token.is_some()),
                ("SNOWFLAKE_WAREHOUSE", self.snowflake.warehouse.is_some()),
                ("SNOWFLAKE_DATABASE", self.snowflake.database.is_some()),
            ]
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect(),
        };

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BiError::Config(format!(
                "{} required for {} connection",
                missing.join(", "),
                target
            )))
        }
    }

    /// Targets whose settings are complete. The embedded engine is always available.
    pub fn available_warehouses(&self) -> Vec<WarehouseTarget> {
        WarehouseTarget::ALL
            .iter()
            .copied()
            .filter(|t| self.validate_target(*t).is_ok())
            .collect()
    }

    /// Values that must never leak into error messages or logs.
    pub fn secrets(&self) -> Vec<String> {
        [
            self.llm.api_key.clone(),
            self.bigquery.access_token.clone(),
            self.snowflake.token.clone(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn parse_num<T: FromStr>(value: Option<String>, default: T, key: &str) -> Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BiError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_local_url(url: &str) -> bool {
    url.contains("://localhost") || url.contains("://127.0.0.1")
}
