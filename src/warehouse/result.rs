//! Execution Result - standardized result format from every warehouse runner

use crate::error::{BiError, Result};
use crate::warehouse::WarehouseTarget;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// One result row: column name -> JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Column names in select-list order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// True when the backend produced more rows than the enforced limit
    pub truncated: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub warehouse: WarehouseTarget,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build a result from positional values, keyed by `columns`.
    ///
    /// Repeated column names (`SELECT a.id, b.id`) get a `_2`, `_3`, ...
    /// suffix so no value is lost when rows are keyed by name.
    pub fn from_values(
        warehouse: WarehouseTarget,
        columns: Vec<String>,
        values: Vec<Vec<serde_json::Value>>,
        elapsed: Duration,
    ) -> Self {
        let columns = unique_column_names(columns);
        let rows: Vec<Row> = values
            .into_iter()
            .map(|vals| {
                columns
                    .iter()
                    .cloned()
                    .zip(vals)
                    .collect::<Row>()
            })
            .collect();

        Self {
            row_count: rows.len(),
            columns,
            rows,
            truncated: false,
            elapsed,
            warehouse,
            executed_at: Utc::now(),
        }
    }

    /// Drop rows beyond `limit`. Idempotent; never clears an existing truncation flag.
    pub fn enforce_limit(&mut self, limit: u64) {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        if self.rows.len() > limit {
            self.rows.truncate(limit);
            self.truncated = true;
        }
        self.row_count = self.rows.len();
    }

    /// Convert to a polars DataFrame, inferring one dtype per column.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let series: Vec<Series> = self
            .columns
            .iter()
            .map(|name| column_to_series(name, &self.rows))
            .collect();

        DataFrame::new(series).map_err(|e| BiError::Execution(format!("Failed to build DataFrame: {}", e)))
    }

    /// Write the rows to `.csv`, `.parquet` or `.json` depending on the extension.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !matches!(extension.as_str(), "csv" | "parquet" | "json") {
            return Err(BiError::InvalidRequest(format!(
                "Unsupported output format '{}' (use csv, parquet or json)",
                extension
            )));
        }

        let mut df = self.to_dataframe()?;
        let mut file = std::fs::File::create(path)
            .map_err(|e| BiError::Execution(format!("Failed to create {}: {}", path.display(), e)))?;

        match extension.as_str() {
            "csv" => CsvWriter::new(&mut file)
                .finish(&mut df)
                .map_err(|e| BiError::Execution(format!("Failed to write CSV: {}", e))),
            "parquet" => ParquetWriter::new(&mut file)
                .finish(&mut df)
                .map(|_| ())
                .map_err(|e| BiError::Execution(format!("Failed to write Parquet: {}", e))),
            _ => JsonWriter::new(&mut file)
                .with_json_format(JsonFormat::Json)
                .finish(&mut df)
                .map_err(|e| BiError::Execution(format!("Failed to write JSON: {}", e))),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ColumnType {
    Null,
    Bool,
    Int,
    Float,
    Text,
}

fn value_type(value: &serde_json::Value) -> ColumnType {
    match value {
        serde_json::Value::Null => ColumnType::Null,
        serde_json::Value::Bool(_) => ColumnType::Bool,
        serde_json::Value::Number(n) if n.is_i64() => ColumnType::Int,
        serde_json::Value::Number(_) => ColumnType::Float,
        _ => ColumnType::Text,
    }
}

fn merge_types(a: ColumnType, b: ColumnType) -> ColumnType {
    match (a, b) {
        (ColumnType::Null, t) | (t, ColumnType::Null) => t,
        (x, y) if x == y => x,
        (ColumnType::Int, ColumnType::Float) | (ColumnType::Float, ColumnType::Int) => ColumnType::Float,
        _ => ColumnType::Text,
    }
}

static NULL: serde_json::Value = serde_json::Value::Null;

fn column_to_series(name: &str, rows: &[Row]) -> Series {
    let values: Vec<&serde_json::Value> = rows
        .iter()
        .map(|row| row.get(name).unwrap_or(&NULL))
        .collect();

    let column_type = values
        .iter()
        .fold(ColumnType::Null, |acc, v| merge_types(acc, value_type(v)));

    match column_type {
        ColumnType::Bool => {
            let data: Vec<Option<bool>> = values.iter().map(|v| v.as_bool()).collect();
            Series::new(name, data)
        }
        ColumnType::Int => {
            let data: Vec<Option<i64>> = values.iter().map(|v| v.as_i64()).collect();
            Series::new(name, data)
        }
        ColumnType::Float => {
            let data: Vec<Option<f64>> = values.iter().map(|v| v.as_f64()).collect();
            Series::new(name, data)
        }
        ColumnType::Null | ColumnType::Text => {
            let data: Vec<Option<String>> = values
                .iter()
                .map(|v| match v {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect();
            Series::new(name, data)
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn unique_column_names(columns: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(columns.len());
    let mut unique = Vec::with_capacity(columns.len());
    for name in columns {
        let mut candidate = name.clone();
        let mut n = 1;
        while seen.contains(&candidate) {
            n += 1;
            candidate = format!("{}_{}", name, n);
        }
        seen.insert(candidate.clone());
        unique.push(candidate);
    }
    unique
}
