//! Retrieval Index
//!
//! Immutable once built. Readers share it through an [`IndexHandle`]; a
//! rebuild produces a new index rather than mutating this one.

use crate::catalog::{catalog_hash, EntryKind, SchemaEntry};
use crate::config::MAX_TOP_K;
use crate::error::{BiError, Result};
use crate::schema_rag::embedder::Embedder;
use crate::schema_rag::lexical::LexicalIndex;
use crate::schema_rag::vector_store::{Embedding, InMemoryVectorStore};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type IndexHandle = Arc<RetrievalIndex>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Entry embeddings available; questions are embedded at query time
    Vector,
    /// Degraded: lexical matching only
    Lexical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    pub entry: SchemaEntry,
    /// Relevance in [0, 1]
    pub score: f32,
}

/// Entries ordered by descending relevance, ties by qualified name.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub entries: Vec<ScoredEntry>,
    /// True when lexical matching stood in for embeddings
    pub degraded: bool,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn qualified_names(&self) -> Vec<&str> {
        self.entries.iter().map(|s| s.entry.qualified_name.as_str()).collect()
    }

    /// Relations the retrieved entries grant access to.
    pub fn relations(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter_map(|s| s.entry.relation())
            .map(str::to_string)
            .collect()
    }
}

pub struct RetrievalIndex {
    entries: Vec<SchemaEntry>,
    lexical: LexicalIndex,
    vectors: Option<InMemoryVectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
    catalog_hash: String,
}

/// Text per entry; tables also list their columns.
fn entry_texts(entries: &[SchemaEntry]) -> Vec<String> {
    let mut columns_by_table: HashMap<&str, Vec<&SchemaEntry>> = HashMap::new();
    for entry in entries.iter().filter(|e| e.kind == EntryKind::Column) {
        if let Some(table) = entry.relation() {
            columns_by_table.entry(table).or_default().push(entry);
        }
    }

    entries
        .iter()
        .map(|entry| {
            let columns = match entry.kind {
                EntryKind::Table => columns_by_table
                    .get(entry.qualified_name.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
                _ => &[],
            };
            entry.search_text(columns)
        })
        .collect()
}

fn sorted_entries(mut entries: Vec<SchemaEntry>) -> Vec<SchemaEntry> {
    entries.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
    entries
}

impl RetrievalIndex {
    /// Embed every entry. Fails with `EmbeddingService` after the embedder's retries.
    pub async fn build(entries: Vec<SchemaEntry>, embedder: Arc<dyn Embedder>) -> Result<IndexHandle> {
        let entries = sorted_entries(entries);
        let texts = entry_texts(&entries);
        info!("Embedding {} catalog entries with {}", entries.len(), embedder.model());

        let vectors = embedder.embed_batch(&texts).await?;
        if vectors.len() != entries.len() {
            return Err(BiError::EmbeddingService(format!(
                "expected {} embeddings, got {}",
                entries.len(),
                vectors.len()
            )));
        }
        Self::assemble(entries, texts, Some(vectors), Some(embedder))
    }

    /// Rebuild from previously computed vectors (entry order = qualified-name order).
    pub fn from_vectors(
        entries: Vec<SchemaEntry>,
        vectors: Vec<Embedding>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<IndexHandle> {
        let entries = sorted_entries(entries);
        let texts = entry_texts(&entries);
        if vectors.len() != entries.len() {
            return Err(BiError::EmbeddingService(format!(
                "expected {} embeddings, got {}",
                entries.len(),
                vectors.len()
            )));
        }
        Self::assemble(entries, texts, Some(vectors), Some(embedder))
    }

    /// Degraded index: lexical matching only, no external calls.
    pub fn build_lexical(entries: Vec<SchemaEntry>) -> IndexHandle {
        let entries = sorted_entries(entries);
        let texts = entry_texts(&entries);
        info!("Built lexical index over {} catalog entries", entries.len());
        Arc::new(Self {
            lexical: LexicalIndex::build(texts.iter().map(String::as_str)),
            catalog_hash: catalog_hash(&entries),
            entries,
            vectors: None,
            embedder: None,
        })
    }

    fn assemble(
        entries: Vec<SchemaEntry>,
        texts: Vec<String>,
        vectors: Option<Vec<Embedding>>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<IndexHandle> {
        let vectors = vectors.map(InMemoryVectorStore::from_vectors).transpose()?;
        Ok(Arc::new(Self {
            lexical: LexicalIndex::build(texts.iter().map(String::as_str)),
            catalog_hash: catalog_hash(&entries),
            entries,
            vectors,
            embedder,
        }))
    }

    pub fn mode(&self) -> IndexMode {
        match (&self.vectors, &self.embedder) {
            (Some(_), Some(_)) => IndexMode::Vector,
            _ => IndexMode::Lexical,
        }
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn catalog_hash(&self) -> &str {
        &self.catalog_hash
    }

    pub fn qualified_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.qualified_name.clone()).collect()
    }

    pub fn vectors(&self) -> Option<&[Embedding]> {
        self.vectors.as_ref().map(|v| v.vectors())
    }

    pub fn get(&self, qualified_name: &str) -> Option<&SchemaEntry> {
        self.entries
            .binary_search_by(|e| e.qualified_name.as_str().cmp(qualified_name))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// The `top_k` most relevant entries for `question`.
    ///
    /// `top_k` must be at least 1; larger values than the hard cap are clamped.
    /// If the question cannot be embedded the query degrades to lexical matching.
    pub async fn query(&self, question: &str, top_k: usize) -> Result<RetrievalResult> {
        let top_k = Self::check_top_k(top_k)?;
        if question.trim().is_empty() {
            return Err(BiError::InvalidRequest("question must not be empty".to_string()));
        }

        if let (Some(vectors), Some(embedder)) = (&self.vectors, &self.embedder) {
            match self.vector_scores(vectors, embedder.as_ref(), question).await {
                Ok(scores) => return Ok(self.rank(scores, top_k, false)),
                Err(e) => warn!("Question embedding failed, using lexical retrieval: {}", e),
            }
        }
        Ok(self.rank(self.lexical.scores(question), top_k, true))
    }

    /// Lexical-only query, regardless of mode.
    pub fn query_lexical(&self, question: &str, top_k: usize) -> Result<RetrievalResult> {
        let top_k = Self::check_top_k(top_k)?;
        Ok(self.rank(self.lexical.scores(question), top_k, true))
    }

    fn check_top_k(top_k: usize) -> Result<usize> {
        if top_k == 0 {
            return Err(BiError::InvalidRequest("top_k must be at least 1".to_string()));
        }
        Ok(top_k.min(MAX_TOP_K))
    }

    async fn vector_scores(
        &self,
        vectors: &InMemoryVectorStore,
        embedder: &dyn Embedder,
        question: &str,
    ) -> Result<Vec<f32>> {
        let query = embedder.embed(question).await?;
        vectors.scores(&query)
    }

    fn rank(&self, scores: Vec<f32>, top_k: usize, degraded: bool) -> RetrievalResult {
        let mut scored: Vec<(usize, f32)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.entries[*ia].qualified_name.cmp(&self.entries[*ib].qualified_name))
        });
        scored.truncate(top_k);

        debug!(
            "Retrieved {} entries (degraded: {})",
            scored.len(),
            degraded
        );
        RetrievalResult {
            entries: scored
                .into_iter()
                .map(|(i, score)| ScoredEntry {
                    entry: self.entries[i].clone(),
                    score,
                })
                .collect(),
            degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Embeds by keyword presence over a tiny fixed vocabulary.
    struct KeywordEmbedder {
        fail_queries: bool,
    }

    const VOCAB: [&str; 4] = ["employee", "department", "office", "salary"];

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model(&self) -> &str {
            "keyword-test"
        }

        async fn embed(&self, text: &str) -> Result<Embedding> {
            if self.fail_queries && !text.contains("table") && !text.contains("column") {
                return Err(BiError::EmbeddingService("offline".to_string()));
            }
            let lower = text.to_lowercase();
            Ok(VOCAB
                .iter()
                .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
                .collect())
        }
    }

    fn catalog() -> Vec<SchemaEntry> {
        vec![
            SchemaEntry::table("main.offices", "Office locations"),
            SchemaEntry::table("main.employees", "One row per employee"),
            SchemaEntry::column("main.employees", "department", "TEXT", "Department of the employee"),
            SchemaEntry::column("main.employees", "salary", "REAL", "Annual salary"),
        ]
    }

    #[tokio::test]
    async fn test_vector_query_orders_and_bounds() {
        let index = RetrievalIndex::build(catalog(), Arc::new(KeywordEmbedder { fail_queries: false }))
            .await
            .unwrap();
        assert_eq!(index.mode(), IndexMode::Vector);

        let result = index.query("employees per department", 2).await.unwrap();
        assert!(!result.degraded);
        assert_eq!(result.len(), 2);
        assert!(result.entries[0].score >= result.entries[1].score);
        assert!(result.entries.iter().all(|s| (0.0..=1.0).contains(&s.score)));
    }

    #[tokio::test]
    async fn test_ties_broken_by_qualified_name() {
        let index = RetrievalIndex::build_lexical(vec![
            SchemaEntry::table("z.payroll", "salary"),
            SchemaEntry::table("a.payroll", "salary"),
            SchemaEntry::table("m.payroll", "salary"),
        ]);
        let result = index.query("salary", 10).await.unwrap();
        assert_eq!(result.qualified_names(), vec!["a.payroll", "m.payroll", "z.payroll"]);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_query_embedding_failure_degrades() {
        let index = RetrievalIndex::build(catalog(), Arc::new(KeywordEmbedder { fail_queries: true }))
            .await
            .unwrap();
        let result = index.query("salary", 3).await.unwrap();
        assert!(result.degraded);
        // The table lists its salary column, so both tie at 1.0
        assert_eq!(
            result.qualified_names(),
            vec!["main.employees", "main.employees.salary"]
        );
    }

    #[tokio::test]
    async fn test_top_k_validation() {
        let index = RetrievalIndex::build_lexical(catalog());
        assert!(matches!(
            index.query("salary", 0).await.unwrap_err(),
            BiError::InvalidRequest(_)
        ));
        let result = index.query("salary", 10_000).await.unwrap();
        assert!(result.len() <= MAX_TOP_K);
    }

    #[test]
    fn test_relations_and_lookup() {
        let index = RetrievalIndex::build_lexical(catalog());
        let result = index.query_lexical("department", 5).unwrap();
        assert!(result.relations().contains("main.employees"));
        assert!(index.get("main.employees.salary").is_some());
        assert!(index.get("main.missing").is_none());
    }
}
