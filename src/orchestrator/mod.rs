//! NL→SQL Orchestrator
//!
//! Drives one question through retrieval, generation, validation and
//! execution. Guardrail rejections are retried by reprompting the model with
//! its own rejected SQL; connection failures are retried with backoff; every
//! other failure is terminal.

pub mod prompt;
pub mod state;

pub use prompt::{load_examples, FewShotExample, PriorAttempt, PromptBuilder};
pub use state::{AnswerState, StateTrace};

use crate::catalog::CatalogStore;
use crate::config::{AppConfig, SafetyLimits, MAX_TOP_K};
use crate::error::{BiError, Result};
use crate::guardrail::{Allowlist, CandidateQuery, Guardrail, ValidationVerdict};
use crate::llm::{extract_sql, ChatModel, LanguageModel};
use crate::observability::{QueryLog, QueryLogEntry};
use crate::warehouse::{ExecutionRequest, ExecutionResult, WarehouseRouter, WarehouseTarget};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// A successfully answered question.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub request_id: Uuid,
    pub result: ExecutionResult,
    /// The validated SQL that was executed
    pub sql: String,
    /// Model generations, including rejected ones
    pub attempts: u32,
    /// Retrieval fell back to lexical matching
    pub degraded: bool,
    pub states: Vec<AnswerState>,
}

/// Mutable bookkeeping for one question; also feeds the query log on failure.
#[derive(Default)]
struct Progress {
    trace: StateTrace,
    sql: Option<String>,
    attempts: u32,
    degraded: bool,
}

pub struct Orchestrator {
    catalog: Arc<CatalogStore>,
    model: Arc<dyn LanguageModel>,
    router: WarehouseRouter,
    guardrail: Guardrail,
    prompts: PromptBuilder,
    limits: SafetyLimits,
    model_timeout: Duration,
    top_k: usize,
    retry_base_delay: Duration,
    query_log: Option<Arc<QueryLog>>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<CatalogStore>,
        model: Arc<dyn LanguageModel>,
        router: WarehouseRouter,
        limits: SafetyLimits,
    ) -> Self {
        Self {
            catalog,
            model,
            router,
            guardrail: Guardrail::from_limits(&limits),
            prompts: PromptBuilder::default(),
            limits,
            model_timeout: Duration::from_secs(60),
            top_k: 8,
            retry_base_delay: Duration::from_millis(200),
            query_log: None,
        }
    }

    /// Wire timeouts, top-k and the query log from the application config.
    pub fn from_config(
        config: &AppConfig,
        catalog: Arc<CatalogStore>,
        model: Arc<dyn LanguageModel>,
        router: WarehouseRouter,
    ) -> Self {
        Self::new(catalog, model, router, config.limits.clone())
            .with_model_timeout(config.llm.timeout)
            .with_top_k(config.retrieval_top_k)
            .with_query_log(Arc::new(QueryLog::new(config.query_log_path.clone())))
    }

    /// Load the catalog, build its index and wire every configured backend.
    pub async fn bootstrap(config: &AppConfig) -> Result<Self> {
        let catalog = Arc::new(CatalogStore::from_config(config).await?);
        catalog.rebuild().await?;
        let model: Arc<dyn LanguageModel> = Arc::new(ChatModel::new(&config.llm)?);
        let router = WarehouseRouter::from_config(config)?;

        let mut orchestrator = Self::from_config(config, catalog, model, router);
        if let Some(path) = &config.examples_path {
            orchestrator = orchestrator.with_prompts(PromptBuilder::new(load_examples(path)?));
        }
        Ok(orchestrator)
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.clamp(1, MAX_TOP_K);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_query_log(mut self, log: Arc<QueryLog>) -> Self {
        self.query_log = Some(log);
        self
    }

    pub fn catalog(&self) -> &Arc<CatalogStore> {
        &self.catalog
    }

    pub fn router(&self) -> &WarehouseRouter {
        &self.router
    }

    pub fn guardrail(&self) -> &Guardrail {
        &self.guardrail
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn query_log(&self) -> Option<&Arc<QueryLog>> {
        self.query_log.as_ref()
    }

    /// Answer `question` against `target`: rows or a typed error, never partial results.
    pub async fn answer(&self, question: &str, target: WarehouseTarget) -> Result<Answer> {
        let request_id = Uuid::new_v4();
        let span = info_span!("answer", %request_id, warehouse = %target);
        let started = Instant::now();
        let mut progress = Progress::default();

        let outcome = self.run(question, target, &mut progress).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &outcome {
            Ok(result) => info!(
                "Answered in {} ms: {} rows after {} attempt(s)",
                elapsed_ms, result.row_count, progress.attempts
            ),
            Err(e) => {
                progress.trace.enter(AnswerState::Failed { kind: e.kind() });
                warn!("Failed after {} ms: {}", elapsed_ms, e);
            }
        });

        if let Some(log) = &self.query_log {
            log.record(QueryLogEntry {
                timestamp: Utc::now(),
                request_id,
                question: question.to_string(),
                warehouse: target,
                sql: progress.sql.clone(),
                attempts: progress.attempts,
                degraded: progress.degraded,
                error: outcome.as_ref().err().map(BiError::kind),
                row_count: outcome.as_ref().ok().map(|r| r.row_count),
                elapsed_ms,
            });
        }

        let result = outcome?;
        Ok(Answer {
            request_id,
            result,
            sql: progress.sql.unwrap_or_default(),
            attempts: progress.attempts,
            degraded: progress.degraded,
            states: progress.trace.into_states(),
        })
    }

    async fn run(&self, question: &str, target: WarehouseTarget, progress: &mut Progress) -> Result<ExecutionResult> {
        if question.trim().is_empty() {
            return Err(BiError::InvalidRequest("question must not be empty".to_string()));
        }
        // Fail before spending a model call on a target nobody serves.
        self.router.runner(target)?;

        progress.trace.enter(AnswerState::Retrieving);
        let snapshot = self.catalog.snapshot()?;
        let retrieval = snapshot.index.query(question, self.top_k).await?;
        progress.degraded = retrieval.degraded;
        if retrieval.degraded {
            warn!("Retrieval running in degraded lexical mode");
        }
        if retrieval.is_empty() {
            warn!("No catalog entries matched the question");
        }
        info!("Retrieved {} entries: {:?}", retrieval.len(), retrieval.qualified_names());

        let allowlist = Allowlist::from_retrieval(&retrieval).with_reference_patterns(&self.limits.allowed_schemas);
        let max_attempts = self.limits.max_reprompts + 1;
        let mut prior: Option<PriorAttempt> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            progress.trace.enter(AnswerState::Prompting { attempt });
            let prompt = self.prompts.build(
                question,
                &retrieval,
                snapshot.index.entries(),
                target,
                self.guardrail.default_limit(),
                prior.as_ref(),
            );
            let reply = self.generate(&prompt).await?;
            let sql = extract_sql(&reply);
            progress.attempts = attempt;
            progress.sql = Some(sql.clone());

            progress.trace.enter(AnswerState::Validating { attempt });
            match self.guardrail.validate(&CandidateQuery::new(sql.clone()), &allowlist) {
                ValidationVerdict::Allowed {
                    normalized_sql,
                    enforced_row_limit,
                } => {
                    progress.sql = Some(normalized_sql.clone());
                    let result = self.execute(normalized_sql, enforced_row_limit, target, progress).await?;
                    progress.trace.enter(AnswerState::Done);
                    return Ok(result);
                }
                ValidationVerdict::Rejected { reason, detail } => {
                    warn!("Attempt {}/{} rejected ({}): {}", attempt, max_attempts, reason, detail);
                    if attempt >= max_attempts {
                        return Err(BiError::UnsafeQuery {
                            attempts: attempt,
                            last: reason,
                            detail,
                        });
                    }
                    progress.trace.enter(AnswerState::Reprompting { attempt, reason });
                    prior = Some(PriorAttempt { sql, reason, detail });
                }
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        match tokio::time::timeout(self.model_timeout, self.model.generate(prompt)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e @ BiError::ModelTimeout(_))) | Ok(Err(e @ BiError::ModelUnavailable(_))) => Err(e),
            Ok(Err(other)) => Err(BiError::ModelUnavailable(other.to_string())),
            Err(_) => Err(BiError::ModelTimeout(self.model_timeout)),
        }
    }

    async fn execute(
        &self,
        sql: String,
        row_limit: u64,
        target: WarehouseTarget,
        progress: &mut Progress,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest {
            sql,
            warehouse_target: target,
            timeout: self.limits.query_timeout,
            row_limit,
        };

        let mut retry = 0;
        loop {
            progress.trace.enter(AnswerState::Executing { retry });
            match self.router.execute(&request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && retry < self.limits.max_connection_retries => {
                    retry += 1;
                    let delay = backoff_delay(self.retry_base_delay, retry);
                    warn!(
                        "Connection error on {} (retry {}/{} in {:?}): {}",
                        target, retry, self.limits.max_connection_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `base * 2^(retry-1)` plus up to half of `base` of jitter.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
    let jitter_ms = (base.as_millis() / 2) as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    exp + Duration::from_millis(jitter)
}
