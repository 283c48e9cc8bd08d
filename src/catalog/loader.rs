//! File catalog source
//!
//! Reads the metadata the transformation pipeline publishes into a directory:
//! `tables.json` (tables with typed, described columns) and an optional
//! `metrics.json` (declarative metric dictionary).

use crate::catalog::{normalize_entries, CatalogSource, SchemaEntry};
use crate::error::{BiError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TableDef {
    #[serde(default)]
    schema: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    synonyms: Vec<String>,
    #[serde(default)]
    columns: Vec<ColumnDef>,
}

#[derive(Debug, Deserialize)]
struct ColumnDef {
    name: String,
    #[serde(rename = "type", alias = "data_type", default)]
    data_type: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    synonyms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MetricDef {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(alias = "calculation_method", default)]
    calculation: Option<String>,
    #[serde(default)]
    expression: Option<String>,
    #[serde(alias = "base_table", default)]
    table: Option<String>,
    #[serde(default)]
    synonyms: Vec<String>,
}

pub struct FileCatalogSource {
    dir: PathBuf,
}

impl FileCatalogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load_json(path: &Path) -> Result<serde_json::Value> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BiError::CatalogUnavailable(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| BiError::CatalogUnavailable(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Accept both `{"<key>": [...]}` and a bare array.
    fn unwrap_list<T: for<'de> Deserialize<'de>>(value: serde_json::Value, key: &str, path: &Path) -> Result<Vec<T>> {
        let list = match value {
            serde_json::Value::Object(mut obj) if obj.contains_key(key) => obj.remove(key).unwrap_or_default(),
            other => other,
        };
        serde_json::from_value(list)
            .map_err(|e| BiError::CatalogUnavailable(format!("Invalid {}: {}", path.display(), e)))
    }
}

fn table_entries(table: TableDef) -> Vec<SchemaEntry> {
    let qualified = match &table.schema {
        Some(schema) if !schema.is_empty() => format!("{}.{}", schema, table.name),
        _ => table.name.clone(),
    };

    let mut entries = Vec::with_capacity(table.columns.len() + 1);
    entries.push(SchemaEntry::table(qualified.clone(), table.description).with_synonyms(table.synonyms));
    for column in table.columns {
        entries.push(
            SchemaEntry::column(
                &qualified,
                &column.name,
                column.data_type.unwrap_or_else(|| "UNKNOWN".to_string()),
                column.description,
            )
            .with_synonyms(column.synonyms),
        );
    }
    entries
}

fn metric_entry(metric: MetricDef) -> SchemaEntry {
    let qualified = if metric.name.contains('.') {
        metric.name.clone()
    } else {
        format!("metrics.{}", metric.name)
    };
    let description = match &metric.calculation {
        Some(calculation) if !calculation.is_empty() => {
            format!("{} (calculation: {})", metric.description, calculation)
        }
        _ => metric.description.clone(),
    };
    SchemaEntry::metric(qualified, description, metric.expression, metric.table)
        .with_synonyms(metric.synonyms)
        .with_synonyms([metric.name.replace('_', " ")])
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn describe(&self) -> String {
        format!("catalog directory {}", self.dir.display())
    }

    async fn load(&self) -> Result<Vec<SchemaEntry>> {
        let tables_path = self.dir.join("tables.json");
        let tables: Vec<TableDef> = Self::unwrap_list(Self::load_json(&tables_path).await?, "tables", &tables_path)?;

        let metrics_path = self.dir.join("metrics.json");
        let metrics: Vec<MetricDef> = if metrics_path.exists() {
            Self::unwrap_list(Self::load_json(&metrics_path).await?, "metrics", &metrics_path)?
        } else {
            debug!("No metrics.json in {}, loading tables only", self.dir.display());
            Vec::new()
        };

        let table_count = tables.len();
        let metric_count = metrics.len();
        let mut entries: Vec<SchemaEntry> = tables.into_iter().flat_map(table_entries).collect();
        entries.extend(metrics.into_iter().map(metric_entry));

        let entries = normalize_entries(entries)?;
        info!(
            "Loaded catalog from {}: {} tables, {} metrics, {} entries",
            self.dir.display(),
            table_count,
            metric_count,
            entries.len()
        );
        Ok(entries)
    }
}
