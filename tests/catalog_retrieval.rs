use async_trait::async_trait;
use bi_assistant::catalog::{CatalogSource, CatalogStore, EntryKind, FileCatalogSource};
use bi_assistant::guardrail::{Allowlist, CandidateQuery, Guardrail};
use bi_assistant::schema_rag::{Embedder, Embedding, IndexMode, VectorCache};
use bi_assistant::{BiError, ErrorKind, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn sample_catalog_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("catalog")
}

/// Keyword-presence vectors over a small vocabulary.
struct KeywordEmbedder {
    calls: AtomicUsize,
}

const VOCAB: [&str; 6] = ["employee", "department", "salary", "office", "city", "headcount"];

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model(&self) -> &str {
        "keyword-test"
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = text.to_lowercase();
        let mut vector: Embedding = VOCAB
            .iter()
            .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
            .collect();
        // Keeps every vector non-zero
        vector.push(0.1);
        Ok(vector)
    }
}

#[tokio::test]
async fn test_file_catalog_loads_tables_columns_and_metrics() {
    let entries = FileCatalogSource::new(sample_catalog_dir()).load().await.unwrap();

    let count = |kind: EntryKind| entries.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EntryKind::Table), 2);
    assert_eq!(count(EntryKind::Column), 9);
    assert_eq!(count(EntryKind::Metric), 2);

    let metric = entries
        .iter()
        .find(|e| e.qualified_name == "metrics.active_headcount")
        .unwrap();
    assert_eq!(metric.relation(), Some("main.employees"));
    assert!(metric.expression.is_some());
    assert!(metric.synonyms.contains("active headcount"));

    let names: Vec<&str> = entries.iter().map(|e| e.qualified_name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn test_missing_catalog_directory() {
    let dir = tempfile::tempdir().unwrap();
    let err = FileCatalogSource::new(dir.path()).load().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CatalogUnavailable);
}

#[tokio::test]
async fn test_duplicate_entries_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("tables.json"),
        r#"[{"schema": "main", "name": "t", "columns": [{"name": "a"}, {"name": "a"}]}]"#,
    )
    .unwrap();
    let err = FileCatalogSource::new(dir.path()).load().await.unwrap_err();
    assert!(matches!(err, BiError::CatalogUnavailable(_)));
}

#[tokio::test]
async fn test_lexical_retrieval_is_ranked_and_deterministic() {
    let store = CatalogStore::new(Arc::new(FileCatalogSource::new(sample_catalog_dir())), None, None);
    let snapshot = store.rebuild().await.unwrap();
    assert!(snapshot.is_degraded());

    let first = snapshot.index.query("headcount by department", 5).await.unwrap();
    let second = snapshot.index.query("headcount by department", 5).await.unwrap();
    assert!(first.degraded);
    assert!(first.len() <= 5 && !first.is_empty());
    assert_eq!(first.qualified_names(), second.qualified_names());

    for pair in first.entries.windows(2) {
        assert!(pair[0].score >= pair[1].score);
        if pair[0].score == pair[1].score {
            assert!(pair[0].entry.qualified_name < pair[1].entry.qualified_name);
        }
    }
    assert!(first.relations().contains("main.employees"));
    assert!(!first.relations().contains("main.offices"));
}

#[tokio::test]
async fn test_vector_index_uses_cache_on_second_build() {
    let cache_dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(KeywordEmbedder { calls: AtomicUsize::new(0) });

    let build = || {
        CatalogStore::new(
            Arc::new(FileCatalogSource::new(sample_catalog_dir())),
            Some(embedder.clone() as Arc<dyn Embedder>),
            Some(VectorCache::new(cache_dir.path())),
        )
    };

    let snapshot = build().rebuild().await.unwrap();
    assert_eq!(snapshot.index.mode(), IndexMode::Vector);
    let calls_after_first = embedder.calls.load(Ordering::SeqCst);
    assert!(calls_after_first >= snapshot.index.len());
    assert!(VectorCache::new(cache_dir.path())
        .path_for(snapshot.catalog_hash())
        .exists());

    let again = build().rebuild().await.unwrap();
    assert_eq!(again.catalog_hash(), snapshot.catalog_hash());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_after_first);

    let result = again.index.query("average salary by department", 3).await.unwrap();
    assert!(!result.degraded);
    assert_eq!(result.len(), 3);
    assert!(result.entries.iter().all(|s| (0.0..=1.0).contains(&s.score)));
    assert!(result.relations().contains("main.employees"));
}

#[tokio::test]
async fn test_retrieved_relations_bound_the_guardrail() {
    let store = CatalogStore::new(Arc::new(FileCatalogSource::new(sample_catalog_dir())), None, None);
    let snapshot = store.rebuild().await.unwrap();
    let retrieval = snapshot.index.query("headcount by department", 5).await.unwrap();
    let allowlist = Allowlist::from_retrieval(&retrieval);
    let guardrail = Guardrail::new(10_000, 1_000);

    let verdict = guardrail.validate(
        &CandidateQuery::new("SELECT department, COUNT(*) FROM main.employees GROUP BY department"),
        &allowlist,
    );
    assert!(verdict.is_allowed());

    let verdict = guardrail.validate(
        &CandidateQuery::new("SELECT e.department, o.city FROM main.employees e JOIN main.offices o ON o.id = e.id"),
        &allowlist,
    );
    let err = verdict.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaViolation);
}
