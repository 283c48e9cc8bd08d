//! Snowflake Runner - cloud analytic warehouse over the SQL API v2
//!
//! Statements are submitted to `/api/v2/statements`. A `202` answer means the
//! statement is still running; its status URL is polled until the result is
//! ready or the deadline passes, in which case the statement is cancelled.

use crate::config::SnowflakeConfig;
use crate::error::{BiError, Result};
use crate::warehouse::redact::Redactor;
use crate::warehouse::{
    classify_status, classify_transport, ExecutionRequest, ExecutionResult, WarehouseRunner,
    WarehouseTarget,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SnowflakeRunner {
    client: Client,
    base_url: String,
    token: String,
    token_type: String,
    warehouse: String,
    database: String,
    schema: Option<String>,
    role: Option<String>,
    redactor: Redactor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    code: Option<String>,
    message: Option<String>,
    statement_handle: Option<String>,
    statement_status_url: Option<String>,
    result_set_meta_data: Option<ResultSetMetaData>,
    data: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    scale: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionInfo {
    row_count: Option<u64>,
}

/// Either a finished result or a statement still executing.
enum Submission {
    Ready(StatementResponse),
    Running(StatementResponse),
}

impl SnowflakeRunner {
    pub fn new(config: &SnowflakeConfig, redactor: Redactor) -> Result<Self> {
        let missing = |name: &str| BiError::Config(format!("{} required for snowflake connection", name));
        let account = config.account.clone().ok_or_else(|| missing("SNOWFLAKE_ACCOUNT"))?;
        let token = config.token.clone().ok_or_else(|| missing("SNOWFLAKE_TOKEN"))?;
        let warehouse = config.warehouse.clone().ok_or_else(|| missing("SNOWFLAKE_WAREHOUSE"))?;
        let database = config.database.clone().ok_or_else(|| missing("SNOWFLAKE_DATABASE"))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| BiError::Config(format!("Failed to create HTTP client for Snowflake: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("https://{}.snowflakecomputing.com", account),
            token,
            token_type: config.token_type.clone(),
            warehouse,
            database,
            schema: config.schema.clone(),
            role: config.role.clone(),
            redactor,
        })
    }

    fn redacted(&self, err: BiError) -> BiError {
        match err {
            BiError::Connection(msg) => BiError::Connection(self.redactor.redact(&msg)),
            BiError::Execution(msg) => BiError::Execution(self.redactor.redact(&msg)),
            other => other,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", &self.token_type)
            .header("Accept", "application/json")
            .header("User-Agent", concat!("bi-assistant/", env!("CARGO_PKG_VERSION")))
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn read_submission(
        &self,
        response: std::result::Result<reqwest::Response, reqwest::Error>,
        timeout: Duration,
    ) -> Result<Submission> {
        let response = response.map_err(|e| classify_transport(&e, timeout))?;
        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::OK {
            let parsed: StatementResponse = response
                .json()
                .await
                .map_err(|e| BiError::Execution(format!("Failed to parse Snowflake response: {}", e)))?;
            return Ok(if status == StatusCode::ACCEPTED {
                Submission::Running(parsed)
            } else {
                Submission::Ready(parsed)
            });
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            // Statement-level failure: compile error, missing object, ...
            let message = serde_json::from_str::<StatementResponse>(&text)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(text);
            return Err(BiError::Execution(format!("Snowflake error: {}", message)));
        }
        Err(classify_status(status, text, timeout))
    }

    async fn submit(&self, sql: &str, timeout: Duration) -> Result<Submission> {
        let url = format!("{}/api/v2/statements", self.base_url);
        let mut body = json!({
            "statement": sql,
            "timeout": timeout.as_secs().max(1),
            "warehouse": self.warehouse,
            "database": self.database,
        });
        if let Some(schema) = &self.schema {
            body["schema"] = json!(schema);
        }
        if let Some(role) = &self.role {
            body["role"] = json!(role);
        }

        let response = self
            .authorized(self.client.post(&url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await;
        self.read_submission(response, timeout).await
    }

    async fn status(&self, status_url: &str, remaining: Duration, timeout: Duration) -> Result<Submission> {
        let response = self
            .authorized(self.client.get(self.resolve(status_url)))
            .timeout(remaining)
            .send()
            .await;
        self.read_submission(response, timeout).await
    }

    async fn partition(&self, handle: &str, index: usize, timeout: Duration) -> Result<Vec<Vec<Value>>> {
        let url = format!("{}/api/v2/statements/{}", self.base_url, handle);
        let response = self
            .authorized(self.client.get(&url))
            .query(&[("partition", index.to_string())])
            .timeout(timeout)
            .send()
            .await;
        match self.read_submission(response, timeout).await? {
            Submission::Ready(r) => Ok(r.data.unwrap_or_default()),
            Submission::Running(_) => Err(BiError::Execution(format!(
                "Snowflake partition {} of {} not ready",
                index, handle
            ))),
        }
    }

    async fn cancel(&self, handle: &str) {
        let url = format!("{}/api/v2/statements/{}/cancel", self.base_url, handle);
        let outcome = self
            .authorized(self.client.post(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match outcome {
            Ok(r) if r.status().is_success() => info!("Cancelled Snowflake statement {}", handle),
            Ok(r) => warn!("Snowflake cancel for {} returned {}", handle, r.status()),
            Err(e) => warn!("Snowflake cancel for {} failed: {}", handle, self.redactor.redact(&e.to_string())),
        }
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let deadline = started + request.timeout;
        let fetch = usize::try_from(request.row_limit.saturating_add(1)).unwrap_or(usize::MAX);
        debug!("Snowflake execute: {}", request.sql);

        let mut submission = self.submit(&request.sql, request.timeout).await?;
        let ready = loop {
            let running = match submission {
                Submission::Ready(r) => break r,
                Submission::Running(r) => r,
            };
            let handle = running.statement_handle.clone().unwrap_or_default();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if !handle.is_empty() {
                    self.cancel(&handle).await;
                }
                return Err(BiError::QueryTimeout(request.timeout));
            }
            let status_url = running
                .statement_status_url
                .clone()
                .or_else(|| (!handle.is_empty()).then(|| format!("/api/v2/statements/{}", handle)))
                .ok_or_else(|| BiError::Execution("Snowflake response had no statement handle".to_string()))?;

            debug!(
                "Snowflake statement {} running ({})",
                handle,
                running.code.as_deref().unwrap_or("-")
            );
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            submission = self.status(&status_url, remaining.max(Duration::from_millis(1)), request.timeout).await?;
        };

        let meta = ready
            .result_set_meta_data
            .unwrap_or(ResultSetMetaData { row_type: Vec::new(), partition_info: Vec::new() });
        let mut data = ready.data.unwrap_or_default();

        // Later partitions are fetched only while more rows are needed.
        if let Some(handle) = ready.statement_handle.as_deref() {
            for index in 1..meta.partition_info.len() {
                if data.len() >= fetch {
                    break;
                }
                debug!(
                    "Fetching Snowflake partition {} ({} rows)",
                    index,
                    meta.partition_info[index].row_count.unwrap_or(0)
                );
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(BiError::QueryTimeout(request.timeout));
                }
                data.extend(self.partition(handle, index, remaining).await?);
            }
        }
        data.truncate(fetch);

        let (columns, values) = decode_rows(&meta.row_type, data);
        let mut result =
            ExecutionResult::from_values(WarehouseTarget::Snowflake, columns, values, started.elapsed());
        result.enforce_limit(request.row_limit);
        Ok(result)
    }
}

fn decode_rows(row_type: &[RowType], data: Vec<Vec<Value>>) -> (Vec<String>, Vec<Vec<Value>>) {
    let columns = row_type.iter().map(|c| c.name.clone()).collect();
    let values = data
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(row_type.iter())
                .map(|(value, column)| convert_cell(value, column))
                .collect()
        })
        .collect();
    (columns, values)
}

/// The SQL API returns every value as a string; restore numeric and boolean types.
fn convert_cell(value: Value, column: &RowType) -> Value {
    let text = match value {
        Value::String(s) => s,
        other => return other,
    };
    match column.column_type.to_lowercase().as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => {
            text.parse::<i64>().map(Value::from).unwrap_or(Value::String(text))
        }
        "fixed" | "real" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "boolean" => match text.to_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

#[async_trait]
impl WarehouseRunner for SnowflakeRunner {
    fn target(&self) -> WarehouseTarget {
        WarehouseTarget::Snowflake
    }

    async fn connect(&self) -> Result<()> {
        let request = ExecutionRequest {
            sql: "SELECT 1".to_string(),
            warehouse_target: WarehouseTarget::Snowflake,
            timeout: Duration::from_secs(30),
            row_limit: 1,
        };
        self.execute(&request).await?;
        info!("Connected to Snowflake database {}", self.database);
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request).await.map_err(|e| self.redacted(e))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
