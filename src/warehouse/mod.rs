//! Warehouse Runners - uniform execution contract over heterogeneous backends
//!
//! - `WarehouseRunner` is the capability set every backend implements
//! - `WarehouseTarget` is the closed set of supported backends
//! - `WarehouseRouter` selects a runner and enforces timeout and row limit

pub mod bigquery;
pub mod embedded;
pub mod pool;
pub mod redact;
pub mod result;
pub mod router;
pub mod snowflake;

use crate::error::{BiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use bigquery::BigQueryRunner;
pub use embedded::EmbeddedRunner;
pub use pool::{BoundedPool, PooledConnection};
pub use redact::Redactor;
pub use result::{ExecutionResult, Row};
pub use router::WarehouseRouter;
pub use snowflake::SnowflakeRunner;

/// Supported warehouse backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarehouseTarget {
    /// Embedded single-file engine (SQLite)
    Embedded,
    /// Cloud columnar warehouse (BigQuery)
    BigQuery,
    /// Cloud analytic warehouse (Snowflake)
    Snowflake,
}

impl WarehouseTarget {
    pub const ALL: [WarehouseTarget; 3] = [
        WarehouseTarget::Embedded,
        WarehouseTarget::BigQuery,
        WarehouseTarget::Snowflake,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WarehouseTarget::Embedded => "embedded",
            WarehouseTarget::BigQuery => "bigquery",
            WarehouseTarget::Snowflake => "snowflake",
        }
    }
}

impl fmt::Display for WarehouseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for WarehouseTarget {
    type Err = BiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "EMBEDDED" | "SQLITE" | "DUCKDB" | "LOCAL" => Ok(WarehouseTarget::Embedded),
            "BIGQUERY" | "BQ" => Ok(WarehouseTarget::BigQuery),
            "SNOWFLAKE" => Ok(WarehouseTarget::Snowflake),
            other => Err(BiError::InvalidRequest(format!(
                "Unsupported warehouse type: {}",
                other
            ))),
        }
    }
}

/// A validated statement bound for one warehouse.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Normalized SQL from an `Allowed` verdict
    pub sql: String,
    pub warehouse_target: WarehouseTarget,
    pub timeout: Duration,
    /// Limit enforced by the guardrail; the runner layer enforces it again
    pub row_limit: u64,
}

/// Execution capability every backend implements.
#[async_trait]
pub trait WarehouseRunner: Send + Sync {
    fn target(&self) -> WarehouseTarget;

    /// Establish (or verify) connectivity. Safe to call repeatedly.
    async fn connect(&self) -> Result<()>;

    /// Run one read-only statement.
    ///
    /// Implementations fetch at most `row_limit + 1` rows where the backend
    /// allows it and report failures as `Connection`, `QueryTimeout` or
    /// `Execution` errors with credentials stripped.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;

    /// Release pooled connections.
    async fn disconnect(&self) -> Result<()>;
}

/// Classify an HTTP status from a warehouse REST API.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String, timeout: Duration) -> BiError {
    if status == reqwest::StatusCode::REQUEST_TIMEOUT {
        BiError::QueryTimeout(timeout)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BiError::Connection(format!("status {}: {}", status, body))
    } else {
        BiError::Execution(format!("status {}: {}", status, body))
    }
}

/// Classify a transport-level failure from `reqwest`.
pub(crate) fn classify_transport(err: &reqwest::Error, timeout: Duration) -> BiError {
    if err.is_timeout() {
        BiError::QueryTimeout(timeout)
    } else if err.is_connect() || err.is_request() {
        BiError::Connection(err.to_string())
    } else {
        BiError::Execution(err.to_string())
    }
}
