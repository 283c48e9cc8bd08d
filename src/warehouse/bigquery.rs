//! BigQuery Runner - cloud columnar warehouse over the REST API
//!
//! Uses `jobs.query` to start the statement and `jobs.getQueryResults` to poll
//! until the job completes or the request deadline passes. A job still running
//! at the deadline is cancelled best-effort.

use crate::config::BigQueryConfig;
use crate::error::{BiError, Result};
use crate::warehouse::redact::Redactor;
use crate::warehouse::{
    classify_status, classify_transport, ExecutionRequest, ExecutionResult, WarehouseRunner,
    WarehouseTarget,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Server-side wait per poll; BigQuery caps long polls anyway.
const POLL_WAIT_MS: u64 = 10_000;

pub struct BigQueryRunner {
    client: Client,
    api_base: String,
    project_id: String,
    dataset: String,
    location: String,
    access_token: String,
    redactor: Redactor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    job_complete: Option<bool>,
    schema: Option<TableSchema>,
    rows: Option<Vec<TableRow>>,
    errors: Option<Vec<ErrorProto>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: String,
    reason: Option<String>,
}

impl BigQueryRunner {
    pub fn new(config: &BigQueryConfig, redactor: Redactor) -> Result<Self> {
        let missing = |name: &str| BiError::Config(format!("{} required for bigquery connection", name));
        let project_id = config.project_id.clone().ok_or_else(|| missing("BQ_PROJECT_ID"))?;
        let dataset = config.dataset.clone().ok_or_else(|| missing("BQ_DATASET"))?;
        let access_token = config.access_token.clone().ok_or_else(|| missing("BQ_ACCESS_TOKEN"))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| BiError::Config(format!("Failed to create HTTP client for BigQuery: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            project_id,
            dataset,
            location: config.location.clone(),
            access_token,
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

    async fn read_response(
        &self,
        response: std::result::Result<reqwest::Response, reqwest::Error>,
        timeout: Duration,
    ) -> Result<QueryResponse> {
        let response = response.map_err(|e| classify_transport(&e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text, timeout));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| BiError::Execution(format!("Failed to parse BigQuery response: {}", e)))?;

        if let Some(errors) = parsed.errors.as_ref().filter(|e| !e.is_empty()) {
            let detail = errors
                .iter()
                .map(|e| match &e.reason {
                    Some(reason) => format!("{} ({})", e.message, reason),
                    None => e.message.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BiError::Execution(format!("BigQuery error: {}", detail)));
        }
        Ok(parsed)
    }

    async fn submit(&self, sql: &str, fetch: u64, remaining: Duration, timeout: Duration) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.api_base, self.project_id);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "maxResults": fetch,
            "timeoutMs": (remaining.as_millis() as u64).min(POLL_WAIT_MS),
            "location": self.location,
            "defaultDataset": {
                "projectId": self.project_id,
                "datasetId": self.dataset,
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .timeout(remaining)
            .json(&body)
            .send()
            .await;
        self.read_response(response, timeout).await
    }

    async fn poll(&self, job: &JobReference, fetch: u64, remaining: Duration, timeout: Duration) -> Result<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, self.project_id, job.job_id
        );
        let location = job.location.clone().unwrap_or_else(|| self.location.clone());
        let wait = (remaining.as_millis() as u64).min(POLL_WAIT_MS);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(remaining + Duration::from_secs(1))
            .query(&[
                ("maxResults", fetch.to_string()),
                ("timeoutMs", wait.to_string()),
                ("location", location),
            ])
            .send()
            .await;
        self.read_response(response, timeout).await
    }

    async fn cancel(&self, job: &JobReference) {
        let url = format!(
            "{}/projects/{}/jobs/{}/cancel",
            self.api_base, self.project_id, job.job_id
        );
        let location = job.location.clone().unwrap_or_else(|| self.location.clone());
        let outcome = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(10))
            .query(&[("location", location)])
            .send()
            .await;
        match outcome {
            Ok(r) if r.status().is_success() => info!("Cancelled BigQuery job {}", job.job_id),
            Ok(r) => warn!("BigQuery cancel for {} returned {}", job.job_id, r.status()),
            Err(e) => warn!("BigQuery cancel for {} failed: {}", job.job_id, self.redactor.redact(&e.to_string())),
        }
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let deadline = started + request.timeout;
        let fetch = request.row_limit.saturating_add(1);
        debug!("BigQuery execute (fetch {}): {}", fetch, request.sql);

        let mut response = self.submit(&request.sql, fetch, request.timeout, request.timeout).await?;
        while !response.job_complete.unwrap_or(false) {
            let job = response
                .job_reference
                .clone()
                .ok_or_else(|| BiError::Execution("BigQuery response had no job reference".to_string()))?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cancel(&job).await;
                return Err(BiError::QueryTimeout(request.timeout));
            }
            debug!("BigQuery job {} still running", job.job_id);
            response = match self.poll(&job, fetch, remaining, request.timeout).await {
                Err(BiError::QueryTimeout(t)) => {
                    self.cancel(&job).await;
                    return Err(BiError::QueryTimeout(t));
                }
                other => other?,
            };
        }

        let (columns, values) = decode_rows(response.schema, response.rows.unwrap_or_default());
        let mut result =
            ExecutionResult::from_values(WarehouseTarget::BigQuery, columns, values, started.elapsed());
        result.enforce_limit(request.row_limit);
        Ok(result)
    }
}

fn decode_rows(schema: Option<TableSchema>, rows: Vec<TableRow>) -> (Vec<String>, Vec<Vec<Value>>) {
    let fields = schema.map(|s| s.fields).unwrap_or_default();
    let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
    let values = rows
        .into_iter()
        .map(|row| {
            row.f
                .into_iter()
                .zip(fields.iter())
                .map(|(cell, field)| convert_cell(cell.v, &field.field_type))
                .collect()
        })
        .collect();
    (columns, values)
}

/// BigQuery returns every scalar as a string; restore the declared type.
fn convert_cell(value: Value, field_type: &str) -> Value {
    let text = match value {
        Value::String(s) => s,
        other => return other,
    };
    match field_type.to_uppercase().as_str() {
        "INTEGER" | "INT64" => text.parse::<i64>().map(Value::from).unwrap_or(Value::String(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

#[async_trait]
impl WarehouseRunner for BigQueryRunner {
    fn target(&self) -> WarehouseTarget {
        WarehouseTarget::BigQuery
    }

    async fn connect(&self) -> Result<()> {
        let url = format!(
            "{}/projects/{}/datasets/{}",
            self.api_base, self.project_id, self.dataset
        );
        let timeout = Duration::from_secs(30);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.redacted(classify_transport(&e, timeout)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.redacted(classify_status(status, text, timeout)));
        }
        info!("Connected to BigQuery dataset {}.{}", self.project_id, self.dataset);
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request).await.map_err(|e| self.redacted(e))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_typed_rows() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "jobReference": {"jobId": "job_1", "location": "US"},
            "schema": {"fields": [
                {"name": "department", "type": "STRING"},
                {"name": "headcount", "type": "INTEGER"},
                {"name": "ratio", "type": "FLOAT"},
                {"name": "active", "type": "BOOLEAN"}
            ]},
            "rows": [
                {"f": [{"v": "Sales"}, {"v": "12"}, {"v": "0.5"}, {"v": "true"}]},
                {"f": [{"v": null}, {"v": "3"}, {"v": null}, {"v": "false"}]}
            ]
        }))
        .unwrap();

        let (columns, values) = decode_rows(response.schema, response.rows.unwrap());
        assert_eq!(columns, vec!["department", "headcount", "ratio", "active"]);
        assert_eq!(values[0], vec![json!("Sales"), json!(12), json!(0.5), json!(true)]);
        assert_eq!(values[1], vec![Value::Null, json!(3), Value::Null, json!(false)]);
    }

    #[test]
    fn test_new_requires_credentials() {
        let config = BigQueryConfig {
            api_base: "https://bigquery.googleapis.com/bigquery/v2".to_string(),
            project_id: Some("proj".to_string()),
            dataset: None,
            location: "US".to_string(),
            access_token: Some("token".to_string()),
        };
        let err = BigQueryRunner::new(&config, Redactor::default()).err().unwrap();
        assert!(err.to_string().contains("BQ_DATASET"));
    }
}
