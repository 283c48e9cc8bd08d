//! Prompt construction for SQL generation
//!
//! The prompt lists only the retrieved relations (the same ones the guardrail
//! will allow), their columns, matching metric definitions, optional few-shot
//! examples and, on a reprompt, the rejected SQL with the reason.

use crate::catalog::{EntryKind, SchemaEntry};
use crate::error::{BiError, ErrorKind, Result};
use crate::schema_rag::RetrievalResult;
use crate::warehouse::WarehouseTarget;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const MAX_EXAMPLES: usize = 5;
const MAX_COLUMNS_PER_RELATION: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

/// Reads `[{"question", "sql"}]` or `{"examples": [...]}`.
pub fn load_examples(path: &Path) -> Result<Vec<FewShotExample>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ExamplesFile {
        Wrapped { examples: Vec<FewShotExample> },
        Bare(Vec<FewShotExample>),
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| BiError::Config(format!("Failed to read examples {}: {}", path.display(), e)))?;
    let parsed: ExamplesFile = serde_json::from_str(&content)
        .map_err(|e| BiError::Config(format!("Failed to parse examples {}: {}", path.display(), e)))?;
    let examples = match parsed {
        ExamplesFile::Wrapped { examples } => examples,
        ExamplesFile::Bare(examples) => examples,
    };
    info!("Loaded {} few-shot examples from {}", examples.len(), path.display());
    Ok(examples)
}

/// The SQL a previous attempt produced and why it was rejected.
#[derive(Debug, Clone)]
pub struct PriorAttempt {
    pub sql: String,
    pub reason: ErrorKind,
    pub detail: String,
}

fn dialect(target: WarehouseTarget) -> &'static str {
    match target {
        WarehouseTarget::Embedded => "SQLite",
        WarehouseTarget::BigQuery => "BigQuery Standard SQL",
        WarehouseTarget::Snowflake => "Snowflake SQL",
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    examples: Vec<FewShotExample>,
}

impl PromptBuilder {
    pub fn new(mut examples: Vec<FewShotExample>) -> Self {
        examples.truncate(MAX_EXAMPLES);
        Self { examples }
    }

    pub fn build(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
        catalog: &[SchemaEntry],
        target: WarehouseTarget,
        row_limit: u64,
        prior: Option<&PriorAttempt>,
    ) -> String {
        let mut parts = Vec::new();

        parts.push(format!(
            "You are an expert analytics engineer. Write one {} query that answers the question.",
            dialect(target)
        ));
        parts.push("RULES:".to_string());
        parts.push("- Only a single read-only SELECT (or WITH ... SELECT) statement".to_string());
        parts.push("- Reference only the relations listed below, spelled exactly as listed".to_string());
        parts.push(format!("- Always end with an explicit LIMIT of at most {}", row_limit));
        parts.push("- Return the SQL only, without explanations".to_string());

        parts.push("\nAVAILABLE SCHEMA:".to_string());
        let relations = group_by_relation(retrieval, catalog);
        if relations.is_empty() {
            parts.push("(no matching tables were found)".to_string());
        }
        for (relation, table_entry) in &relations {
            match table_entry {
                Some(table) if !table.description.is_empty() => parts.push(format!("- {}: {}", relation, table.description)),
                _ => parts.push(format!("- {}", relation)),
            }
            if let Some(table) = table_entry.filter(|t| !t.synonyms.is_empty()) {
                parts.push(format!("    (also called: {})", table.synonyms.iter().join(", ")));
            }
            let columns: Vec<&SchemaEntry> = catalog
                .iter()
                .filter(|e| e.kind == EntryKind::Column && e.relation() == Some(relation.as_str()))
                .collect();
            for column in columns.iter().take(MAX_COLUMNS_PER_RELATION) {
                let data_type = column.data_type.as_deref().unwrap_or("unknown");
                if column.description.is_empty() {
                    parts.push(format!("    {} {}", column.short_name(), data_type));
                } else {
                    parts.push(format!("    {} {} -- {}", column.short_name(), data_type, column.description));
                }
            }
            if columns.len() > MAX_COLUMNS_PER_RELATION {
                parts.push(format!("    ... and {} more", columns.len() - MAX_COLUMNS_PER_RELATION));
            }
        }

        let metrics: Vec<&SchemaEntry> = retrieval
            .entries
            .iter()
            .map(|s| &s.entry)
            .filter(|e| e.kind == EntryKind::Metric)
            .collect();
        if !metrics.is_empty() {
            parts.push("\nBUSINESS METRICS:".to_string());
            for metric in metrics {
                parts.push(format!("- {}: {}", metric.short_name(), metric.description));
                if let Some(expression) = &metric.expression {
                    parts.push(format!("    Expression: {}", expression));
                }
            }
        }

        if !self.examples.is_empty() {
            parts.push("\nEXAMPLES:".to_string());
            for (i, example) in self.examples.iter().enumerate() {
                parts.push(format!("Example {}:\nQuestion: {}\nSQL: {}", i + 1, example.question, example.sql));
            }
        }

        if let Some(prior) = prior {
            parts.push("\nPREVIOUS ATTEMPT WAS REJECTED:".to_string());
            parts.push(format!("SQL: {}", prior.sql));
            parts.push(format!("Reason: {} ({})", prior.reason, prior.detail));
            parts.push("Write a corrected query that follows the rules.".to_string());
        }

        parts.push(format!("\nQUESTION: {}", question));
        parts.push("SQL:".to_string());
        parts.join("\n")
    }
}

/// Retrieved relations with their table entry, when the catalog has one.
fn group_by_relation<'a>(retrieval: &RetrievalResult, catalog: &'a [SchemaEntry]) -> BTreeMap<String, Option<&'a SchemaEntry>> {
    retrieval
        .relations()
        .into_iter()
        .map(|relation| {
            let table = catalog
                .iter()
                .find(|e| e.kind == EntryKind::Table && e.qualified_name == relation);
            (relation, table)
        })
        .collect()
}
