//! Schema Catalog - tables, columns and metrics the assistant may reference
//!
//! Entries are immutable once loaded and keyed by `qualified_name`. Sources
//! only read metadata published by the transformation pipeline; a rebuild
//! replaces the whole set through [`CatalogStore`].

pub mod loader;
pub mod postgres;
pub mod store;

use crate::error::{BiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

pub use loader::FileCatalogSource;
pub use postgres::PostgresCatalogSource;
pub use store::{CatalogSnapshot, CatalogStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Table,
    Column,
    Metric,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::Table => "table",
            EntryKind::Column => "column",
            EntryKind::Metric => "metric",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub qualified_name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub synonyms: BTreeSet<String>,
    /// Owning table of a column, base table of a metric
    #[serde(default)]
    pub parent: Option<String>,
    /// Metric calculation
    #[serde(default)]
    pub expression: Option<String>,
}

impl SchemaEntry {
    pub fn table(qualified_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            kind: EntryKind::Table,
            data_type: None,
            description: description.into(),
            synonyms: BTreeSet::new(),
            parent: None,
            expression: None,
        }
    }

    pub fn column(
        table: &str,
        name: &str,
        data_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            qualified_name: format!("{}.{}", table, name),
            kind: EntryKind::Column,
            data_type: Some(data_type.into()),
            description: description.into(),
            synonyms: BTreeSet::new(),
            parent: Some(table.to_string()),
            expression: None,
        }
    }

    pub fn metric(
        qualified_name: impl Into<String>,
        description: impl Into<String>,
        expression: Option<String>,
        base_table: Option<String>,
    ) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            kind: EntryKind::Metric,
            data_type: None,
            description: description.into(),
            synonyms: BTreeSet::new(),
            parent: base_table,
            expression,
        }
    }

    pub fn with_synonyms<I, S>(mut self, synonyms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms.extend(synonyms.into_iter().map(Into::into));
        self
    }

    /// The relation this entry grants access to, if any.
    ///
    /// A table names itself; a column names its owning table; a metric names
    /// its base table.
    pub fn relation(&self) -> Option<&str> {
        match self.kind {
            EntryKind::Table => Some(self.qualified_name.as_str()),
            EntryKind::Column => self
                .parent
                .as_deref()
                .or_else(|| self.qualified_name.rsplit_once('.').map(|(table, _)| table)),
            EntryKind::Metric => self.parent.as_deref(),
        }
    }

    /// Last dotted segment of the qualified name.
    pub fn short_name(&self) -> &str {
        self.qualified_name
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.qualified_name)
    }

    /// Text handed to the embedder and the lexical scorer.
    pub fn search_text(&self, columns: &[&SchemaEntry]) -> String {
        let mut text = format!("{} {}", self.kind, self.qualified_name);
        if let Some(data_type) = &self.data_type {
            text.push_str(&format!(" ({})", data_type));
        }
        if !self.description.is_empty() {
            text.push_str(&format!(": {}", self.description));
        }
        if !self.synonyms.is_empty() {
            let synonyms: Vec<&str> = self.synonyms.iter().map(String::as_str).collect();
            text.push_str(&format!(" Also known as: {}.", synonyms.join(", ")));
        }
        if let Some(expression) = &self.expression {
            text.push_str(&format!(" Expression: {}.", expression));
        }
        if !columns.is_empty() {
            let names: Vec<&str> = columns.iter().map(|c| c.short_name()).collect();
            text.push_str(&format!(" Columns: {}.", names.join(", ")));
        }
        text
    }
}

/// Anything that can produce the full set of catalog entries.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Read every entry. Fails with `CatalogUnavailable` if the store cannot be read.
    async fn load(&self) -> Result<Vec<SchemaEntry>>;
}

/// A fixed set of entries, mostly useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalogSource {
    entries: Vec<SchemaEntry>,
}

impl InMemoryCatalogSource {
    pub fn new(entries: Vec<SchemaEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalogSource {
    fn describe(&self) -> String {
        format!("in-memory catalog ({} entries)", self.entries.len())
    }

    async fn load(&self) -> Result<Vec<SchemaEntry>> {
        Ok(self.entries.clone())
    }
}

/// Sort by qualified name and reject duplicate keys.
pub fn normalize_entries(mut entries: Vec<SchemaEntry>) -> Result<Vec<SchemaEntry>> {
    entries.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
    let mut seen = HashSet::new();
    for entry in &entries {
        if entry.qualified_name.trim().is_empty() {
            return Err(BiError::CatalogUnavailable(
                "catalog entry with empty qualified name".to_string(),
            ));
        }
        if !seen.insert(entry.qualified_name.as_str()) {
            return Err(BiError::CatalogUnavailable(format!(
                "duplicate catalog entry '{}'",
                entry.qualified_name
            )));
        }
    }
    Ok(entries)
}

/// SHA-256 over the canonical JSON of the entries, sorted by qualified name.
pub fn catalog_hash(entries: &[SchemaEntry]) -> String {
    let mut sorted: Vec<&SchemaEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));

    let mut hasher = Sha256::new();
    for entry in sorted {
        // Serializing a plain struct of strings cannot fail.
        if let Ok(json) = serde_json::to_string(entry) {
            hasher.update(json.as_bytes());
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
